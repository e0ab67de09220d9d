use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tracing::info;

use crate::core::error::{CoreError, CoreResult};
use crate::core::events::EventSink;
use crate::core::session::{Session, SessionConfig, SessionStatus};
use crate::core::workdir::DirAllocator;

pub const MAX_NAME_LEN: usize = 64;
const RESERVED_NAMES: &[&str] = &["default"];

/// Process-wide registry of named sessions with a designated default.
///
/// Registry locks are held for O(1) work only; child spawning happens outside
/// them behind a name reservation that is rolled back on failure.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    reserved: StdMutex<HashSet<String>>,
    default_name: RwLock<String>,
    startup_default: String,
    allocator: DirAllocator,
    template: SessionConfig,
    events: Arc<dyn EventSink>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(
        allocator: DirAllocator,
        template: SessionConfig,
        startup_default: &str,
        max_sessions: usize,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reserved: StdMutex::new(HashSet::new()),
            default_name: RwLock::new(startup_default.to_string()),
            startup_default: startup_default.to_string(),
            allocator,
            template,
            events,
            max_sessions,
        }
    }

    /// Materialize the default session. Must complete before the queue starts
    /// dispatching; failure here is fatal for startup.
    pub fn create_default(&self) -> CoreResult<Arc<Session>> {
        self.open(&self.startup_default.clone(), None)
    }

    /// Open a named session. The name is reserved first, the child spawned
    /// outside the registry lock, then the session committed (or the
    /// reservation rolled back).
    pub fn open(&self, name: &str, workdir_override: Option<&Path>) -> CoreResult<Arc<Session>> {
        validate_name(name)?;

        {
            let mut reserved = self.reserved.lock().expect("reservation lock");
            let sessions = self.sessions.read().expect("registry lock");
            if sessions.contains_key(name) || reserved.contains(name) {
                return Err(CoreError::NameExists(name.to_string()));
            }
            if sessions.len() + reserved.len() >= self.max_sessions {
                return Err(CoreError::TooManySessions(self.max_sessions));
            }
            reserved.insert(name.to_string());
        }

        let spawned = self.spawn_session(name, workdir_override);

        self.reserved
            .lock()
            .expect("reservation lock")
            .remove(name);

        match spawned {
            Ok(session) => {
                self.sessions
                    .write()
                    .expect("registry lock")
                    .insert(name.to_string(), session.clone());
                Ok(session)
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_session(
        &self,
        name: &str,
        workdir_override: Option<&Path>,
    ) -> CoreResult<Arc<Session>> {
        let workdir = match workdir_override {
            Some(path) => self.allocator.validate_override(path)?,
            None => self.allocator.allocate(name)?,
        };
        Session::open(name, workdir, self.template.clone(), self.events.clone())
    }

    /// Close and remove a named session. The default session is protected;
    /// it can only be reset through the administrative path.
    pub async fn close(&self, name: &str) -> CoreResult<()> {
        if *self.default_name.read().expect("default lock") == name {
            return Err(CoreError::IsDefault);
        }
        let session = self
            .sessions
            .write()
            .expect("registry lock")
            .remove(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        session.close().await;
        info!("session '{}' removed from registry", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("registry lock")
            .get(name)
            .cloned()
    }

    pub fn default_session(&self) -> Option<Arc<Session>> {
        let name = self.default_name();
        self.get(&name)
    }

    pub fn default_name(&self) -> String {
        self.default_name.read().expect("default lock").clone()
    }

    /// Route a message: a leading `@name` token selects a known session and
    /// is stripped; anything else goes to the default with the text intact.
    pub fn resolve(&self, text: &str) -> (String, String) {
        if let Some(rest) = text.strip_prefix('@') {
            if let Some((name, remainder)) = rest.split_once(char::is_whitespace) {
                if !name.is_empty()
                    && self
                        .sessions
                        .read()
                        .expect("registry lock")
                        .contains_key(name)
                {
                    return (name.to_string(), remainder.to_string());
                }
            }
        }
        (self.default_name(), text.to_string())
    }

    /// Change the default routing target. `None` reverts to the configured
    /// startup default.
    pub fn set_default(&self, name: Option<&str>) -> CoreResult<String> {
        let target = match name {
            Some(name) => {
                if self.get(name).is_none() {
                    return Err(CoreError::NotFound(name.to_string()));
                }
                name.to_string()
            }
            None => self.startup_default.clone(),
        };
        *self.default_name.write().expect("default lock") = target.clone();
        info!("default session set to '{}'", target);
        Ok(target)
    }

    pub fn list(&self) -> Vec<SessionStatus> {
        let mut out: Vec<SessionStatus> = self
            .sessions
            .read()
            .expect("registry lock")
            .values()
            .map(|s| s.status())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("registry lock").len()
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .expect("registry lock")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}

fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::NameInvalid(name.to_string()));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '@')
    {
        return Err(CoreError::NameInvalid(name.to_string()));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(CoreError::NameReserved(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::tests::{fake_assistant, ECHO_SCRIPT};
    use crate::core::events::test_support::RecordingSink;
    use std::time::Duration;

    fn manager(tmp: &tempfile::TempDir) -> SessionManager {
        manager_with_bin(tmp, fake_assistant(tmp.path(), ECHO_SCRIPT), 32)
    }

    fn manager_with_bin(tmp: &tempfile::TempDir, bin: String, max: usize) -> SessionManager {
        SessionManager::new(
            DirAllocator::new(tmp.path().join("sessions")),
            SessionConfig {
                assistant_bin: bin,
                model: None,
                ask_timeout: Duration::from_secs(5),
                env: Vec::new(),
            },
            "main",
            max,
            Arc::new(RecordingSink::default()),
        )
    }

    #[tokio::test]
    async fn name_length_boundary_is_64() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        let ok_name = "a".repeat(64);
        assert!(mgr.open(&ok_name, None).is_ok());

        let too_long = "a".repeat(65);
        assert!(matches!(
            mgr.open(&too_long, None),
            Err(CoreError::NameInvalid(_))
        ));

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn invalid_and_reserved_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        assert!(matches!(mgr.open("", None), Err(CoreError::NameInvalid(_))));
        assert!(matches!(
            mgr.open("has space", None),
            Err(CoreError::NameInvalid(_))
        ));
        assert!(matches!(
            mgr.open("at@sign", None),
            Err(CoreError::NameInvalid(_))
        ));
        assert!(matches!(
            mgr.open("default", None),
            Err(CoreError::NameReserved(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_open_returns_name_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        mgr.open("alpha", None).unwrap();
        assert!(matches!(
            mgr.open("alpha", None),
            Err(CoreError::NameExists(_))
        ));

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn failed_spawn_rolls_back_the_reservation() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_with_bin(&tmp, "/nonexistent/assistant".to_string(), 32);

        assert!(matches!(
            mgr.open("alpha", None),
            Err(CoreError::SpawnFailed(_))
        ));
        // The name is free again, not stuck as NameExists.
        assert!(matches!(
            mgr.open("alpha", None),
            Err(CoreError::SpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn resolve_strips_known_prefixes_and_falls_back_otherwise() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.create_default().unwrap();
        mgr.open("alpha", None).unwrap();

        assert_eq!(
            mgr.resolve("@alpha do the thing"),
            ("alpha".to_string(), "do the thing".to_string())
        );
        // Unknown name: routed to default with the text untouched.
        assert_eq!(
            mgr.resolve("@gamma hi"),
            ("main".to_string(), "@gamma hi".to_string())
        );
        // No prefix at all.
        assert_eq!(
            mgr.resolve("plain text"),
            ("main".to_string(), "plain text".to_string())
        );
        // Prefix without any message body.
        assert_eq!(
            mgr.resolve("@alpha"),
            ("main".to_string(), "@alpha".to_string())
        );

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn default_session_cannot_be_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.create_default().unwrap();

        assert!(matches!(mgr.close("main").await, Err(CoreError::IsDefault)));
        assert!(matches!(
            mgr.close("ghost").await,
            Err(CoreError::NotFound(_))
        ));

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn set_default_switches_and_reverts() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.create_default().unwrap();
        mgr.open("alpha", None).unwrap();

        mgr.set_default(Some("alpha")).unwrap();
        assert_eq!(mgr.default_name(), "alpha");
        // The previous default is now closable.
        mgr.close("main").await.unwrap();

        assert!(matches!(
            mgr.set_default(Some("ghost")),
            Err(CoreError::NotFound(_))
        ));

        mgr.set_default(None).unwrap();
        assert_eq!(mgr.default_name(), "main");

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_with_bin(&tmp, fake_assistant(tmp.path(), ECHO_SCRIPT), 1);
        mgr.create_default().unwrap();

        assert!(matches!(
            mgr.open("alpha", None),
            Err(CoreError::TooManySessions(1))
        ));

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn override_workdir_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);

        let missing = tmp.path().join("not-there");
        assert!(matches!(
            mgr.open("alpha", Some(&missing)),
            Err(CoreError::WorkdirInvalid(_))
        ));

        let custom = tmp.path().join("custom");
        std::fs::create_dir_all(&custom).unwrap();
        let session = mgr.open("alpha", Some(&custom)).unwrap();
        assert_eq!(session.workdir(), &custom);

        mgr.close_all().await;
    }
}
