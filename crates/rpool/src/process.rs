//! Connection to an engine running as a child process.
//!
//! The engine speaks the [`wire`](crate::wire) protocol on its stdin/stdout.
//! Its working directory is queried once per session, at connect time.

use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use serde::Deserialize;

use crate::connection::{Connection, ConnectionFactory, ConnectionId, ConnectionState};
use crate::error::ConnectionError;
use crate::wire::{DEFAULT_MAX_FRAME_LENGTH, EngineRequest, EngineResponse, FramedChannel};

/// How to launch the engine program.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Directory under which the engine creates per-session working
    /// directories. When set, a session's working directory is removed on
    /// close, but only if it sits directly under this root.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,

    /// Largest request or response body exchanged with the engine, in bytes.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            scratch_root: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Remove `dir` if it is a direct child of `root`. Returns whether anything
/// was removed.
fn remove_scratch_dir(root: &Path, dir: &Path) -> bool {
    if dir.parent() != Some(root) {
        tracing::warn!(
            dir = %dir.display(),
            root = %root.display(),
            "Working directory is not directly under the scratch root, keeping it"
        );
        return false;
    }
    match std::fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "Could not remove working directory");
            false
        }
    }
}

struct EngineProcess {
    child: Child,
    channel: FramedChannel<ChildStdout, ChildStdin>,
}

impl EngineProcess {
    fn spawn(config: &ProcessConfig) -> Result<Self, ConnectionError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ConnectionError::Connect(format!("spawn {}: {e}", config.program.display()))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ConnectionError::Connect("engine stdio not captured".into()));
        };

        Ok(Self {
            child,
            channel: FramedChannel::new(stdout, stdin)
                .with_max_frame_length(config.max_frame_length),
        })
    }

    fn kill(mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "Engine process already exited");
        }
        let _ = self.child.wait();
    }
}

/// One engine process per session.
pub struct ProcessConnection {
    id: ConnectionId,
    config: Arc<ProcessConfig>,
    process: Option<EngineProcess>,
    working_dir: Option<PathBuf>,
    state: ConnectionState,
}

impl ProcessConnection {
    pub fn connect(config: Arc<ProcessConfig>) -> Result<Self, ConnectionError> {
        let mut conn = Self {
            id: ConnectionId::new(),
            config,
            process: None,
            working_dir: None,
            state: ConnectionState::Uninitialized,
        };
        conn.establish()?;
        Ok(conn)
    }

    fn establish(&mut self) -> Result<(), ConnectionError> {
        let mut process = EngineProcess::spawn(&self.config)?;
        let working_dir = match process
            .channel
            .request::<_, EngineResponse>(EngineRequest::WorkingDirectory)
            .and_then(EngineResponse::into_working_directory)
        {
            Ok(dir) => dir,
            Err(e) => {
                process.kill();
                self.state = ConnectionState::Broken;
                return Err(ConnectionError::Connect(e.to_string()));
            }
        };

        tracing::debug!(
            connection = %self.id,
            pid = process.child.id(),
            working_dir = %working_dir.display(),
            "Engine process connected"
        );
        self.process = Some(process);
        self.working_dir = Some(working_dir);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Kill the process and drop its scratch directory, if configured.
    fn teardown(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
        let dir = self.working_dir.take();
        if let (Some(root), Some(dir)) = (self.config.scratch_root.as_deref(), dir)
            && remove_scratch_dir(root, &dir)
        {
            tracing::debug!(
                connection = %self.id,
                dir = %dir.display(),
                "Removed working directory"
            );
        }
    }
}

impl Connection for ProcessConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn evaluate(&mut self, code: &str) -> Result<serde_json::Value, ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(ConnectionError::TransportClosed("engine not running".into()));
        };

        let response = process
            .channel
            .request::<_, EngineResponse>(EngineRequest::Eval { code: code.into() })
            .inspect_err(|e| {
                if e.is_transport() {
                    self.state = ConnectionState::Broken;
                }
            })?;
        response.into_value()
    }

    fn reset(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.teardown();
        self.establish()
    }

    fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.teardown();
        self.state = ConnectionState::Closed;
        tracing::debug!(connection = %self.id, "Engine process closed");
    }

    fn working_directory(&mut self) -> Result<PathBuf, ConnectionError> {
        match (&self.working_dir, self.state) {
            (_, ConnectionState::Closed) => Err(ConnectionError::Closed),
            (Some(dir), _) => Ok(dir.clone()),
            (None, _) => Err(ConnectionError::TransportClosed("engine not running".into())),
        }
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// [`ConnectionFactory`] launching one engine process per connection.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    config: Arc<ProcessConfig>,
}

impl ProcessSpawner {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

impl ConnectionFactory for ProcessSpawner {
    fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        Ok(Box::new(ProcessConnection::connect(Arc::clone(&self.config))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_program_fails_to_connect() {
        let spawner = ProcessSpawner::new(ProcessConfig::new("/nonexistent/engine-binary"));
        assert!(matches!(
            spawner.connect(),
            Err(ConnectionError::Connect(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn engine_exiting_immediately_fails_to_connect() {
        let spawner = ProcessSpawner::new(ProcessConfig::new("true"));
        assert!(matches!(
            spawner.connect(),
            Err(ConnectionError::Connect(_))
        ));
    }

    #[test]
    fn scratch_dir_directly_under_root_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("conn1");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("WordCount.R"), "x").unwrap();

        assert!(remove_scratch_dir(root.path(), &dir));
        assert!(!dir.exists());
    }

    #[test]
    fn nested_or_foreign_dirs_are_kept() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let elsewhere = tempfile::tempdir().unwrap();

        assert!(!remove_scratch_dir(root.path(), &nested));
        assert!(!remove_scratch_dir(root.path(), elsewhere.path()));
        assert!(!remove_scratch_dir(root.path(), root.path()));
        assert!(nested.exists());
        assert!(elsewhere.path().exists());
    }

    #[test]
    fn config_from_json() {
        let cfg: ProcessConfig = serde_json::from_str(
            r#"{"program": "rpool-engine", "args": ["--vanilla"], "scratch_root": "/tmp/Rserv"}"#,
        )
        .unwrap();
        assert_eq!(cfg.program, PathBuf::from("rpool-engine"));
        assert_eq!(cfg.args, vec!["--vanilla".to_string()]);
        assert_eq!(cfg.scratch_root.as_deref(), Some(Path::new("/tmp/Rserv")));

        let cfg: ProcessConfig = serde_json::from_str(r#"{"program": "engine"}"#).unwrap();
        assert!(cfg.args.is_empty());
        assert!(cfg.scratch_root.is_none());
        assert_eq!(cfg.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);

        let cfg: ProcessConfig =
            serde_json::from_str(r#"{"program": "engine", "max_frame_length": 1024}"#).unwrap();
        assert_eq!(cfg.max_frame_length, 1024);
    }

    /// A tiny engine speaking the wire protocol. `name <- value` assigns,
    /// a bare name reads (null when unset), `stop(msg)` fails with `msg` and
    /// `quit()` exits without answering.
    #[cfg(unix)]
    const SCRIPTED_ENGINE: &str = r#"
import json, struct, sys, tempfile

inp, out = sys.stdin.buffer, sys.stdout.buffer
wd = tempfile.mkdtemp(dir=sys.argv[1])
env = {}

def send(msg):
    body = json.dumps(msg).encode()
    out.write(struct.pack(">I", len(body)) + body)
    out.flush()

while True:
    head = inp.read(4)
    if len(head) < 4:
        break
    req = json.loads(inp.read(struct.unpack(">I", head)[0]))
    if req["type"] == "working_directory":
        send({"type": "working_directory", "path": wd})
        continue
    code = req["code"].strip()
    if code == "quit()":
        sys.exit(0)
    elif code.startswith("stop(") and code.endswith(")"):
        send({"type": "error", "message": code[5:-1]})
    elif "<-" in code:
        name, value = (part.strip() for part in code.split("<-", 1))
        env[name] = value
        send({"type": "value", "value": value})
    else:
        send({"type": "value", "value": env.get(code)})
"#;

    #[cfg(unix)]
    struct ScriptedEngine {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    impl ScriptedEngine {
        /// `None` when python3 is not installed.
        fn install() -> Option<Self> {
            let found = Command::new("python3")
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|status| status.success());
            if !found {
                eprintln!("python3 not found, skipping scripted engine test");
                return None;
            }

            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("engine.py"), SCRIPTED_ENGINE).unwrap();
            std::fs::create_dir(dir.path().join("scratch")).unwrap();
            Some(Self { dir })
        }

        fn scratch_root(&self) -> PathBuf {
            self.dir.path().join("scratch")
        }

        fn config(&self) -> ProcessConfig {
            let script = self.dir.path().join("engine.py");
            ProcessConfig::new("python3")
                .with_arg(script.to_string_lossy())
                .with_arg(self.scratch_root().to_string_lossy())
                .with_scratch_root(self.scratch_root())
        }
    }

    #[cfg(unix)]
    #[test]
    fn live_engine_evaluates_and_keeps_session_state() {
        let Some(engine) = ScriptedEngine::install() else {
            return;
        };
        let mut conn = ProcessConnection::connect(Arc::new(engine.config())).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let wd = conn.working_directory().unwrap();
        assert_eq!(wd.parent(), Some(engine.scratch_root().as_path()));
        assert!(wd.is_dir());

        assert_eq!(conn.evaluate("x <- 5").unwrap(), json!("5"));
        assert_eq!(conn.evaluate("x").unwrap(), json!("5"));
        assert_eq!(conn.evaluate("unset").unwrap(), json!(null));

        assert_eq!(
            conn.evaluate("stop(object 'y' not found)"),
            Err(ConnectionError::Remote("object 'y' not found".into()))
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.evaluate("x").unwrap(), json!("5"));
    }

    #[cfg(unix)]
    #[test]
    fn reset_respawns_with_fresh_state_and_scratch_dir() {
        let Some(engine) = ScriptedEngine::install() else {
            return;
        };
        let mut conn = ProcessConnection::connect(Arc::new(engine.config())).unwrap();
        conn.evaluate("x <- 5").unwrap();
        let before = conn.working_directory().unwrap();

        conn.reset().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.evaluate("x").unwrap(), json!(null));
        assert!(!before.exists());

        let after = conn.working_directory().unwrap();
        assert_ne!(after, before);
        assert!(after.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn engine_exit_breaks_the_connection_until_reset() {
        let Some(engine) = ScriptedEngine::install() else {
            return;
        };
        let mut conn = ProcessConnection::connect(Arc::new(engine.config())).unwrap();

        let err = conn.evaluate("quit()").unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(conn.evaluate("x").unwrap_err().is_transport());

        conn.reset().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.evaluate("y <- 1").unwrap(), json!("1"));
    }

    #[cfg(unix)]
    #[test]
    fn close_removes_scratch_dir_and_refuses_calls() {
        let Some(engine) = ScriptedEngine::install() else {
            return;
        };
        let mut conn = ProcessConnection::connect(Arc::new(engine.config())).unwrap();
        let wd = conn.working_directory().unwrap();

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!wd.exists());
        assert_eq!(conn.evaluate("x"), Err(ConnectionError::Closed));
        assert_eq!(conn.reset(), Err(ConnectionError::Closed));
        assert_eq!(conn.working_directory(), Err(ConnectionError::Closed));

        // Closing twice is harmless.
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn pooled_engine_sessions_are_reset_on_checkin() {
        use crate::{ConnectionPool, PoolConfig};

        let Some(engine) = ScriptedEngine::install() else {
            return;
        };
        let pool =
            ConnectionPool::new(PoolConfig::new(1), Arc::new(ProcessSpawner::new(engine.config())))
                .unwrap();

        let mut handle = pool.checkout().unwrap();
        assert_eq!(handle.evaluate("x <- 5").unwrap(), json!("5"));
        let first_wd = handle.working_directory().unwrap();
        pool.checkin(handle).unwrap();
        assert!(!first_wd.exists());

        assert_eq!(pool.eval("x").unwrap(), json!(null));

        pool.shutdown();
        let leftovers = std::fs::read_dir(engine.scratch_root()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
