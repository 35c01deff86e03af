//! Repository watcher
//!
//! Each watched project gets up to four notify handles (control directory,
//! index file, refs tree, working tree). Raw events from any of them feed one
//! debounce slot per project; a single dispatcher thread owns every slot and
//! emits `repo-updated` once per quiet window.

use crate::debounce::DebounceState;
use crate::events::{Broadcaster, RepoEvent};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// What a low-level handle observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    ControlDir,
    IndexFile,
    Refs,
    WorkingTree,
}

enum Message {
    Register { project_id: String, generation: u64 },
    Raw { project_id: String, generation: u64 },
    Cancel { project_id: String, generation: u64 },
    Shutdown,
}

struct WatchSession {
    generation: u64,
    handles: Vec<(WatchTarget, RecommendedWatcher)>,
}

struct Slot {
    generation: u64,
    state: DebounceState,
}

/// Owns every active watch session
pub struct RepoWatcher {
    sessions: Mutex<HashMap<String, WatchSession>>,
    tx: Sender<Message>,
    next_generation: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RepoWatcher {
    /// Start the dispatcher thread. Notifications go out through `events`.
    pub fn new(events: Broadcaster, quiet: Duration) -> Self {
        let (tx, rx) = channel();
        let dispatcher = std::thread::Builder::new()
            .name("repocache-watch".to_string())
            .spawn(move || run_dispatcher(rx, events, quiet))
            .map_err(|e| log::error!("failed to start watch dispatcher: {}", e))
            .ok();

        Self {
            sessions: Mutex::new(HashMap::new()),
            tx,
            next_generation: AtomicU64::new(0),
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// Watch a repository, replacing any previous session for the project.
    ///
    /// `git_dir` is the control directory as reported by git; without it the
    /// directory is guessed from `cwd`, which only works at the repository
    /// root. Returns how many handles were established. Handles that fail
    /// (missing path, OS limits) are skipped; zero handles leaves the project
    /// inert. After `close` nothing is registered and 0 is returned.
    pub fn watch_project(&self, project_id: &str, cwd: &Path, git_dir: Option<&Path>) -> usize {
        if !self.is_running() {
            log::warn!("watcher is closed; not watching {}", project_id);
            return 0;
        }
        self.unwatch_project(project_id);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(Message::Register { project_id: project_id.to_string(), generation });

        let git_dir = git_dir.map(Path::to_path_buf).unwrap_or_else(|| resolve_git_dir(cwd));
        let targets = [
            (WatchTarget::ControlDir, git_dir.clone(), RecursiveMode::NonRecursive),
            (WatchTarget::IndexFile, git_dir.join("index"), RecursiveMode::NonRecursive),
            (WatchTarget::Refs, git_dir.join("refs"), RecursiveMode::Recursive),
            (WatchTarget::WorkingTree, cwd.to_path_buf(), RecursiveMode::Recursive),
        ];

        let mut handles = Vec::with_capacity(targets.len());
        for (target, path, mode) in targets {
            let skip_under = (target == WatchTarget::WorkingTree).then(|| git_dir.clone());
            match self.open_handle(project_id, generation, &path, mode, skip_under) {
                Ok(handle) => handles.push((target, handle)),
                Err(e) => log::debug!("{:?} watch on {} not established: {}", target, path.display(), e),
            }
        }

        let count = handles.len();
        log::info!("watching {} with {} handle(s)", project_id, count);
        self.lock_sessions()
            .insert(project_id.to_string(), WatchSession { generation, handles });
        count
    }

    fn open_handle(
        &self,
        project_id: &str,
        generation: u64,
        path: &Path,
        mode: RecursiveMode,
        skip_under: Option<PathBuf>,
    ) -> notify::Result<RecommendedWatcher> {
        let tx = self.tx.clone();
        let project_id = project_id.to_string();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if is_relevant(&event, skip_under.as_deref()) {
                        let _ = tx.send(Message::Raw { project_id: project_id.clone(), generation });
                    }
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(path, mode)?;
        Ok(watcher)
    }

    /// Stop watching a project and drop any pending notification.
    /// Unknown or already-unwatched projects are a no-op.
    pub fn unwatch_project(&self, project_id: &str) -> bool {
        let Some(session) = self.lock_sessions().remove(project_id) else {
            return false;
        };
        let _ = self.tx.send(Message::Cancel { project_id: project_id.to_string(), generation: session.generation });
        log::info!("stopped watching {}", project_id);
        true
    }

    pub fn unwatch_all(&self) {
        let drained: Vec<(String, WatchSession)> = self.lock_sessions().drain().collect();
        for (project_id, session) in drained {
            let _ = self.tx.send(Message::Cancel { project_id, generation: session.generation });
        }
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        self.lock_sessions().contains_key(project_id)
    }

    /// Targets currently held for a project
    pub fn watch_targets(&self, project_id: &str) -> Vec<WatchTarget> {
        self.lock_sessions()
            .get(project_id)
            .map(|s| s.handles.iter().map(|(target, _)| *target).collect())
            .unwrap_or_default()
    }

    /// Tear down all sessions and stop the dispatcher. Safe to call twice.
    pub fn close(&self) {
        self.unwatch_all();
        let handle = self.lock_dispatcher().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(Message::Shutdown);
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.lock_dispatcher().is_some()
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, WatchSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn inject_raw_event(&self, project_id: &str) {
        let generation = self.lock_sessions().get(project_id).map(|s| s.generation);
        if let Some(generation) = generation {
            let _ = self.tx.send(Message::Raw { project_id: project_id.to_string(), generation });
        }
    }
}

impl Drop for RepoWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// `.git` directory, or the directory a `.git` file points at (worktrees,
/// submodules). Falls back to `<cwd>/.git` so the handle just fails to open.
fn resolve_git_dir(cwd: &Path) -> PathBuf {
    let dot_git = cwd.join(".git");
    if dot_git.is_file() {
        if let Ok(contents) = std::fs::read_to_string(&dot_git) {
            if let Some(target) = contents.lines().find_map(|l| l.strip_prefix("gitdir:")) {
                let target = Path::new(target.trim());
                return if target.is_absolute() { target.to_path_buf() } else { cwd.join(target) };
            }
        }
    }
    dot_git
}

/// Reads do not count; working-tree events inside the control directory are
/// left to the dedicated handles.
fn is_relevant(event: &Event, skip_under: Option<&Path>) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    match skip_under {
        Some(dir) if !event.paths.is_empty() => !event.paths.iter().all(|p| p.starts_with(dir)),
        _ => true,
    }
}

fn run_dispatcher(rx: Receiver<Message>, events: Broadcaster, quiet: Duration) {
    let mut slots: HashMap<String, Slot> = HashMap::new();

    loop {
        let next_deadline = slots.values().filter_map(|s| s.state.deadline()).min();
        let message = match next_deadline {
            Some(deadline) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => return,
            },
        };

        match message {
            Some(Message::Register { project_id, generation }) => {
                slots.insert(project_id, Slot { generation, state: DebounceState::Idle });
            }
            Some(Message::Raw { project_id, generation }) => {
                if let Some(slot) = slots.get_mut(&project_id) {
                    if slot.generation == generation {
                        slot.state.trigger(Instant::now(), quiet);
                    }
                }
            }
            Some(Message::Cancel { project_id, generation }) => {
                if slots.get(&project_id).is_some_and(|s| s.generation == generation) {
                    slots.remove(&project_id);
                }
            }
            Some(Message::Shutdown) => return,
            None => {}
        }

        let now = Instant::now();
        for (project_id, slot) in slots.iter_mut() {
            if slot.state.poll(now) {
                log::debug!("repo-updated {}", project_id);
                events.emit(RepoEvent::updated(project_id, chrono::Utc::now().timestamp_millis()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const QUIET: Duration = Duration::from_millis(50);

    // Real filesystem writes need a wider window than injected events
    const FS_QUIET: Duration = Duration::from_millis(250);

    fn setup() -> (tempfile::TempDir, RepoWatcher, Receiver<RepoEvent>) {
        setup_with(QUIET)
    }

    fn setup_with(quiet: Duration) -> (tempfile::TempDir, RepoWatcher, Receiver<RepoEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let events = Broadcaster::new();
        let rx = events.subscribe();
        (dir, RepoWatcher::new(events, quiet), rx)
    }

    /// Replace `.git/index` the way git does (write a lock file, rename over)
    /// and move a branch ref
    fn touch_control_dir(git_dir: &Path) {
        let lock = git_dir.join("index.lock");
        std::fs::write(&lock, b"DIRC-updated").unwrap();
        std::fs::rename(&lock, git_dir.join("index")).unwrap();
        std::fs::write(git_dir.join("refs/heads/main"), b"0123456789abcdef0123456789abcdef01234567\n").unwrap();
    }

    fn fake_repo(dir: &Path) {
        std::fs::create_dir_all(dir.join(".git/refs/heads")).unwrap();
        std::fs::write(dir.join(".git/index"), b"DIRC").unwrap();
        std::fs::write(dir.join(".git/HEAD"), b"ref: refs/heads/main\n").unwrap();
    }

    fn drain_updates(rx: &Receiver<RepoEvent>, wait: Duration) -> Vec<RepoEvent> {
        let mut out = Vec::new();
        let until = Instant::now() + wait;
        while let Ok(event) = rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_burst_coalesces_to_one_signal() {
        let (dir, watcher, rx) = setup();
        watcher.watch_project("p1", dir.path(), None);

        for _ in 0..25 {
            watcher.inject_raw_event("p1");
        }

        let events = drain_updates(&rx, QUIET * 8);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "repo-updated");
        assert_eq!(events[0].project_id(), Some("p1"));
    }

    #[test]
    fn test_spaced_events_signal_separately() {
        let (dir, watcher, rx) = setup();
        watcher.watch_project("p1", dir.path(), None);

        watcher.inject_raw_event("p1");
        sleep(QUIET * 5);
        watcher.inject_raw_event("p1");

        assert_eq!(drain_updates(&rx, QUIET * 8).len(), 2);
    }

    #[test]
    fn test_unwatch_cancels_pending_signal() {
        let (dir, watcher, rx) = setup();
        watcher.watch_project("p1", dir.path(), None);
        watcher.inject_raw_event("p1");
        assert!(watcher.unwatch_project("p1"));

        assert!(drain_updates(&rx, QUIET * 6).is_empty());
        assert!(!watcher.is_watching("p1"));
    }

    #[test]
    fn test_unwatch_unknown_is_noop() {
        let (_dir, watcher, _rx) = setup();
        assert!(!watcher.unwatch_project("never-watched"));
        assert!(!watcher.unwatch_project("never-watched"));
        watcher.unwatch_all();
        watcher.close();
        watcher.close();
    }

    #[test]
    fn test_rewatch_replaces_session() {
        let (dir, watcher, rx) = setup();
        fake_repo(dir.path());

        assert_eq!(watcher.watch_project("p1", dir.path(), None), 4);
        assert_eq!(watcher.watch_project("p1", dir.path(), None), 4);
        assert_eq!(
            watcher.watch_targets("p1"),
            vec![WatchTarget::ControlDir, WatchTarget::IndexFile, WatchTarget::Refs, WatchTarget::WorkingTree]
        );

        watcher.inject_raw_event("p1");
        assert_eq!(drain_updates(&rx, QUIET * 8).len(), 1);
    }

    #[test]
    fn test_missing_paths_skip_handles() {
        let (dir, watcher, _rx) = setup();
        // No .git at all: only the working tree handle can open
        assert_eq!(watcher.watch_project("p1", dir.path(), None), 1);
        assert_eq!(watcher.watch_targets("p1"), vec![WatchTarget::WorkingTree]);

        assert_eq!(watcher.watch_project("p2", &dir.path().join("does-not-exist"), None), 0);
        assert!(watcher.is_watching("p2"));
    }

    #[test]
    fn test_unwatch_all_clears_sessions() {
        let (dir, watcher, _rx) = setup();
        watcher.watch_project("a", dir.path(), None);
        watcher.watch_project("b", dir.path(), None);
        watcher.unwatch_all();
        assert!(!watcher.is_watching("a"));
        assert!(!watcher.is_watching("b"));
    }

    #[test]
    fn test_working_tree_write_notifies() {
        let (dir, watcher, rx) = setup();
        fake_repo(dir.path());
        watcher.watch_project("p1", dir.path(), None);
        sleep(QUIET);

        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.project_id(), Some("p1"));
    }

    #[test]
    fn test_control_dir_writes_signal_once() {
        let (dir, watcher, rx) = setup_with(FS_QUIET);
        fake_repo(dir.path());
        assert_eq!(watcher.watch_project("p1", dir.path(), None), 4);
        sleep(QUIET);

        touch_control_dir(&dir.path().join(".git"));

        let events = drain_updates(&rx, FS_QUIET * 6);
        assert_eq!(events.len(), 1, "{:?}", events);
        assert_eq!(events[0].project_id(), Some("p1"));
    }

    #[test]
    fn test_subdirectory_project_uses_given_git_dir() {
        let (dir, watcher, rx) = setup_with(FS_QUIET);
        fake_repo(dir.path());
        let sub = dir.path().join("crates/core");
        std::fs::create_dir_all(&sub).unwrap();
        let git_dir = dir.path().join(".git");

        // Guessing from the subdirectory finds nothing but the working tree
        assert_eq!(watcher.watch_project("guess", &sub, None), 1);
        watcher.unwatch_project("guess");

        assert_eq!(watcher.watch_project("p1", &sub, Some(&git_dir)), 4);
        sleep(QUIET);

        touch_control_dir(&git_dir);

        let events = drain_updates(&rx, FS_QUIET * 6);
        assert_eq!(events.len(), 1, "{:?}", events);
        assert_eq!(events[0].project_id(), Some("p1"));
    }

    #[test]
    fn test_watch_after_close_is_inert() {
        let (dir, watcher, _rx) = setup();
        fake_repo(dir.path());
        watcher.close();

        assert_eq!(watcher.watch_project("p1", dir.path(), None), 0);
        assert!(!watcher.is_watching("p1"));
        assert!(watcher.watch_targets("p1").is_empty());
    }

    #[test]
    fn test_resolve_git_dir_follows_gitfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".git"), "gitdir: ../main/.git/worktrees/wt\n").unwrap();
        assert_eq!(resolve_git_dir(dir.path()), dir.path().join("../main/.git/worktrees/wt"));

        let plain = tempfile::tempdir().unwrap();
        assert_eq!(resolve_git_dir(plain.path()), plain.path().join(".git"));
    }

    #[test]
    fn test_access_events_ignored() {
        let read = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(PathBuf::from("/r/a"));
        assert!(!is_relevant(&read, None));

        let inside = Event::new(EventKind::Any).add_path(PathBuf::from("/r/.git/objects/ab"));
        assert!(!is_relevant(&inside, Some(Path::new("/r/.git"))));
        assert!(is_relevant(&inside, None));

        let outside = Event::new(EventKind::Any).add_path(PathBuf::from("/r/src/lib.rs"));
        assert!(is_relevant(&outside, Some(Path::new("/r/.git"))));
    }
}
