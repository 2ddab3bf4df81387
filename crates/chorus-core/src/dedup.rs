//! Request deduplication with failure blackout.
//!
//! Every generation request is fingerprinted into a [`RequestSignature`].
//! While a request with that signature is in flight, identical requests join
//! it through an [`InFlight`] handle instead of issuing a second upstream
//! call. When the in-flight request fails, the signature is blacked out for a
//! while so immediate retries are rejected rather than resubmitted.
//!
//! Admission (check + register) happens under a single lock, so two
//! concurrent identical requests can never both become the leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::types::{personality_key, GenerationRequest};

/// Settled value shared between every caller of one signature.
pub type Outcome<T> = std::result::Result<T, CoreError>;

// ── Signature ──

/// Deterministic fingerprint of a request. Two requests with the same
/// signature are considered identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature(String);

impl RequestSignature {
    /// Hash the fields that affect the response. Timestamps and request ids
    /// are deliberately left out.
    pub fn compute(
        personality: &str,
        user_id: &str,
        persona_id: &str,
        channel_id: &str,
        conversation_id: &str,
        auth_scope: &str,
        content: &str,
    ) -> Self {
        let personality = personality_key(personality);
        let mut hasher = Sha256::new();
        for field in [
            personality.as_str(),
            user_id,
            persona_id,
            channel_id,
            conversation_id,
            auth_scope,
            content,
        ] {
            // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        RequestSignature(hex::encode(hasher.finalize()))
    }

    pub fn from_request(req: &GenerationRequest) -> Self {
        Self::compute(
            &req.personality,
            &req.user_id,
            &req.persona_id,
            &req.channel_id,
            &req.conversation_id,
            &req.auth_scope,
            &req.content,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── In-flight handle ──

/// Cloneable handle to a result that has not settled yet.
pub struct InFlight<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

/// Producer side of an [`InFlight`]. Dropping it without calling
/// [`Completer::complete`] settles every waiter with an "abandoned" error.
pub struct Completer<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

/// Create a linked completer/handle pair.
pub fn in_flight<T>() -> (Completer<T>, InFlight<T>) {
    let (tx, rx) = watch::channel(None);
    (Completer { tx }, InFlight { rx })
}

impl<T> Completer<T> {
    pub fn complete(self, outcome: Outcome<T>) {
        // send_replace stores the value even when nobody is listening yet.
        self.tx.send_replace(Some(outcome));
    }
}

impl<T: Clone> InFlight<T> {
    /// Wait for the outcome. Every clone observes the same value.
    pub async fn wait(mut self) -> Outcome<T> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(CoreError::Closed(
                        "in-flight request abandoned before settling".into(),
                    ))
                });
            }
        }
    }

    /// The outcome, if it has already settled.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        self.rx.borrow().clone()
    }
}

// ── Deduplicator ──

#[derive(Debug, Clone, Copy)]
pub struct DedupSettings {
    /// Pending entries older than this are treated as stale.
    pub pending_ttl: Duration,
    /// How long a failed signature is rejected.
    pub blackout: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(30),
            blackout: Duration::from_secs(60),
        }
    }
}

/// Result of [`RequestDeduplicator::admit`].
pub enum Admission<T> {
    /// No identical request is in flight. The caller owns the upstream call
    /// and must settle it through the completer.
    Leader(Completer<T>),
    /// An identical request is in flight. Await its outcome.
    Follower(InFlight<T>),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pending_removed: usize,
    pub blackouts_removed: usize,
}

struct PendingEntry<T> {
    id: u64,
    handle: InFlight<T>,
    inserted_at: Instant,
}

struct DedupState<T> {
    pending: HashMap<RequestSignature, PendingEntry<T>>,
    blackouts: HashMap<RequestSignature, Instant>,
    next_id: u64,
}

struct Inner<T> {
    state: Mutex<DedupState<T>>,
    settings: DedupSettings,
}

/// In-process guard against duplicate and recently failed requests.
///
/// Cheap to clone; clones share the same maps.
pub struct RequestDeduplicator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DedupState {
                    pending: HashMap::new(),
                    blackouts: HashMap::new(),
                    next_id: 0,
                }),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> DedupSettings {
        self.inner.settings
    }

    /// Returns the in-flight handle for `signature`, if any.
    ///
    /// Fails with [`CoreError::Blackout`] while a blackout is active.
    pub fn check_duplicate(&self, signature: &RequestSignature) -> Result<Option<InFlight<T>>> {
        let mut state = self.inner.state.lock();
        self.check_locked(&mut state, signature, Instant::now())
    }

    /// Record an in-flight handle. The entry is removed when the handle
    /// settles; a failed settlement installs a blackout.
    ///
    /// Fails with [`CoreError::Duplicate`] if a live entry already exists.
    pub fn register_pending(&self, signature: RequestSignature, handle: InFlight<T>) -> Result<()> {
        let id = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            if self.check_locked(&mut state, &signature, now)?.is_some() {
                return Err(CoreError::Duplicate);
            }
            Self::insert_locked(&mut state, signature.clone(), handle.clone(), now)
        };
        self.watch_settlement(signature, id, handle);
        Ok(())
    }

    /// Check and register in one step.
    pub fn admit(&self, signature: &RequestSignature) -> Result<Admission<T>> {
        let (completer, handle, id) = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            if let Some(existing) = self.check_locked(&mut state, signature, now)? {
                debug!(signature = %signature.short(), "joining in-flight request");
                return Ok(Admission::Follower(existing));
            }
            let (completer, handle) = in_flight();
            let id = Self::insert_locked(&mut state, signature.clone(), handle.clone(), now);
            (completer, handle, id)
        };
        self.watch_settlement(signature.clone(), id, handle);
        Ok(Admission::Leader(completer))
    }

    /// Remove stale pending entries and expired blackouts.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let ttl = self.inner.settings.pending_ttl;
        let mut state = self.inner.state.lock();

        let before_pending = state.pending.len();
        state.pending.retain(|sig, entry| {
            let keep = now.duration_since(entry.inserted_at) < ttl;
            if !keep {
                debug!(signature = %sig.short(), "sweeping stale pending entry");
            }
            keep
        });
        let before_blackouts = state.blackouts.len();
        state.blackouts.retain(|sig, until| {
            let keep = *until > now;
            if !keep {
                debug!(signature = %sig.short(), "sweeping expired blackout");
            }
            keep
        });

        SweepReport {
            pending_removed: before_pending - state.pending.len(),
            blackouts_removed: before_blackouts - state.blackouts.len(),
        }
    }

    /// Run [`sweep`](Self::sweep) on every tick until `shutdown` fires.
    pub fn spawn_sweeper(&self, mut ticker: Interval, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = this.sweep();
                        if report != SweepReport::default() {
                            debug!(
                                pending = report.pending_removed,
                                blackouts = report.blackouts_removed,
                                "dedup sweep"
                            );
                        }
                    }
                }
            }
        })
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn blackout_len(&self) -> usize {
        self.inner.state.lock().blackouts.len()
    }

    fn check_locked(
        &self,
        state: &mut DedupState<T>,
        signature: &RequestSignature,
        now: Instant,
    ) -> Result<Option<InFlight<T>>> {
        if let Some(until) = state.blackouts.get(signature).copied() {
            if until > now {
                info!(signature = %signature.short(), "rejecting blacked-out request");
                return Err(CoreError::Blackout {
                    retry_after: until - now,
                });
            }
            debug!(signature = %signature.short(), "blackout expired");
            state.blackouts.remove(signature);
        }

        let ttl = self.inner.settings.pending_ttl;
        let stale = match state.pending.get(signature) {
            Some(entry) if now.duration_since(entry.inserted_at) < ttl => {
                return Ok(Some(entry.handle.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            debug!(signature = %signature.short(), "dropping stale pending entry");
            state.pending.remove(signature);
        }
        Ok(None)
    }

    fn insert_locked(
        state: &mut DedupState<T>,
        signature: RequestSignature,
        handle: InFlight<T>,
        now: Instant,
    ) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            signature,
            PendingEntry {
                id,
                handle,
                inserted_at: now,
            },
        );
        id
    }

    fn watch_settlement(&self, signature: RequestSignature, id: u64, handle: InFlight<T>) {
        let this = self.clone();
        tokio::spawn(async move {
            let failed = handle.wait().await.is_err();
            this.settle(&signature, id, failed);
        });
    }

    fn settle(&self, signature: &RequestSignature, id: u64, failed: bool) {
        let mut state = self.inner.state.lock();
        // A newer entry may have replaced a stale one; only remove our own.
        let superseded = match state.pending.get(signature).map(|e| e.id) {
            Some(current) if current == id => {
                state.pending.remove(signature);
                false
            }
            Some(_) => true,
            None => false,
        };
        if !failed {
            return;
        }
        if superseded {
            debug!(
                signature = %signature.short(),
                "superseded request failed, newer one still in flight"
            );
            return;
        }
        let until = Instant::now() + self.inner.settings.blackout;
        state.blackouts.insert(signature.clone(), until);
        info!(
            signature = %signature.short(),
            blackout_secs = self.inner.settings.blackout.as_secs(),
            "request failed, signature blacked out"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sig(content: &str) -> RequestSignature {
        RequestSignature::compute("Nova", "u1", "p1", "chan-1", "c1", "guild", content)
    }

    fn dedup() -> RequestDeduplicator<String> {
        RequestDeduplicator::new(DedupSettings {
            pending_ttl: Duration::from_secs(30),
            blackout: Duration::from_secs(60),
        })
    }

    async fn settled(d: &RequestDeduplicator<String>) {
        while d.pending_len() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_signature_stable_and_case_insensitive() {
        let a = RequestSignature::compute("Nova", "u1", "p1", "ch", "c1", "s", "hello");
        let b = RequestSignature::compute("  nova ", "u1", "p1", "ch", "c1", "s", "hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_signature_separates_material_fields() {
        let base = RequestSignature::compute("Nova", "u1", "p1", "ch", "c1", "s", "hello");
        let variants = [
            RequestSignature::compute("Echo", "u1", "p1", "ch", "c1", "s", "hello"),
            RequestSignature::compute("Nova", "u2", "p1", "ch", "c1", "s", "hello"),
            RequestSignature::compute("Nova", "u1", "p2", "ch", "c1", "s", "hello"),
            RequestSignature::compute("Nova", "u1", "p1", "ch2", "c1", "s", "hello"),
            RequestSignature::compute("Nova", "u1", "p1", "ch", "c2", "s", "hello"),
            RequestSignature::compute("Nova", "u1", "p1", "ch", "c1", "t", "hello"),
            RequestSignature::compute("Nova", "u1", "p1", "ch", "c1", "s", "hello!"),
        ];
        for variant in &variants {
            assert_ne!(&base, variant);
        }
        // Field boundaries matter.
        assert_ne!(
            RequestSignature::compute("ab", "c", "", "", "", "", ""),
            RequestSignature::compute("a", "bc", "", "", "", "", "")
        );
    }

    #[tokio::test]
    async fn test_requests_for_other_persona_or_channel_both_lead() {
        let d = dedup();
        let base = RequestSignature::compute("Nova", "u1", "persona-1", "chan-1", "c1", "", "hello");
        let other_persona =
            RequestSignature::compute("Nova", "u1", "persona-2", "chan-1", "c1", "", "hello");
        let other_channel =
            RequestSignature::compute("Nova", "u1", "persona-1", "chan-2", "c1", "", "hello");
        let mut completers = Vec::new();
        for signature in [&base, &other_persona, &other_channel] {
            match d.admit(signature).unwrap() {
                Admission::Leader(c) => completers.push(c),
                Admission::Follower(_) => panic!("distinct request joined another"),
            }
        }
        assert_eq!(d.pending_len(), 3);
        for c in completers {
            c.complete(Ok("done".into()));
        }
        settled(&d).await;
    }

    #[tokio::test]
    async fn test_follower_receives_leader_result() {
        let d = dedup();
        let completer = match d.admit(&sig("hello")).unwrap() {
            Admission::Leader(c) => c,
            Admission::Follower(_) => panic!("first request must lead"),
        };
        let follower = match d.admit(&sig("hello")).unwrap() {
            Admission::Follower(h) => h,
            Admission::Leader(_) => panic!("second request must follow"),
        };

        completer.complete(Ok("hi there".to_string()));
        assert_eq!(follower.wait().await.unwrap(), "hi there");
        settled(&d).await;
        assert_eq!(d.blackout_len(), 0);
        assert!(d.check_duplicate(&sig("hello")).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_single_leader() {
        let d = dedup();
        let leaders = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let d = d.clone();
            let leaders = Arc::clone(&leaders);
            let admitted = Arc::clone(&admitted);
            tasks.push(tokio::spawn(async move {
                let admission = d.admit(&sig("race")).unwrap();
                admitted.fetch_add(1, Ordering::SeqCst);
                match admission {
                    Admission::Leader(c) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        // Hold the upstream call open until everyone has arrived.
                        while admitted.load(Ordering::SeqCst) < 16 {
                            tokio::task::yield_now().await;
                        }
                        c.complete(Ok("once".to_string()));
                        "once".to_string()
                    }
                    Admission::Follower(h) => h.wait().await.unwrap(),
                }
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), "once");
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_installs_blackout_until_expiry() {
        let d = dedup();
        let Admission::Leader(c) = d.admit(&sig("boom")).unwrap() else {
            panic!("expected leader");
        };
        c.complete(Err(CoreError::Failed {
            job_id: "j1".into(),
            message: "upstream 500".into(),
        }));
        settled(&d).await;

        match d.check_duplicate(&sig("boom")) {
            Err(CoreError::Blackout { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected blackout, got {:?}", other.map(|h| h.is_some())),
        }
        // Unrelated signatures are unaffected.
        assert!(d.check_duplicate(&sig("other")).unwrap().is_none());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(d.admit(&sig("boom")).is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(d.admit(&sig("boom")), Ok(Admission::Leader(_))));
    }

    #[tokio::test]
    async fn test_abandoned_leader_fails_followers() {
        let d = dedup();
        let Admission::Leader(c) = d.admit(&sig("drop")).unwrap() else {
            panic!("expected leader");
        };
        let Admission::Follower(h) = d.admit(&sig("drop")).unwrap() else {
            panic!("expected follower");
        };
        drop(c);
        assert!(matches!(h.wait().await, Err(CoreError::Closed(_))));
        settled(&d).await;
        assert_eq!(d.blackout_len(), 1);
    }

    #[tokio::test]
    async fn test_register_pending_rejects_duplicate() {
        let d = dedup();
        let (c1, h1) = in_flight::<String>();
        d.register_pending(sig("x"), h1).unwrap();
        let (_c2, h2) = in_flight::<String>();
        assert!(matches!(
            d.register_pending(sig("x"), h2),
            Err(CoreError::Duplicate)
        ));

        let existing = d.check_duplicate(&sig("x")).unwrap().unwrap();
        c1.complete(Ok("done".into()));
        assert_eq!(existing.wait().await.unwrap(), "done");
        settled(&d).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_stale_and_expired() {
        let d = dedup();
        // A leader that never settles.
        let Admission::Leader(_hung) = d.admit(&sig("hung")).unwrap() else {
            panic!("expected leader");
        };
        let Admission::Leader(c) = d.admit(&sig("fail")).unwrap() else {
            panic!("expected leader");
        };
        c.complete(Err(CoreError::Provider("bad gateway".into())));
        while d.blackout_len() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(d.sweep(), SweepReport::default());

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = d.sweep();
        assert_eq!(report.pending_removed, 1);
        assert_eq!(report.blackouts_removed, 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(d.sweep().blackouts_removed, 1);
        assert_eq!(d.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_pending_is_replaced_on_admission() {
        let d = dedup();
        let Admission::Leader(_old) = d.admit(&sig("slow")).unwrap() else {
            panic!("expected leader");
        };
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(d.admit(&sig("slow")), Ok(Admission::Leader(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_failure_does_not_black_out() {
        let d = dedup();
        let Admission::Leader(old) = d.admit(&sig("slow")).unwrap() else {
            panic!("expected leader");
        };
        tokio::time::advance(Duration::from_secs(31)).await;
        let Admission::Leader(newer) = d.admit(&sig("slow")).unwrap() else {
            panic!("expected stale entry to be replaced");
        };

        old.complete(Err(CoreError::Provider("late failure".into())));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(d.blackout_len(), 0);
        // The newer request is still joinable.
        assert!(d.check_duplicate(&sig("slow")).unwrap().is_some());

        newer.complete(Err(CoreError::Provider("failed too".into())));
        while d.blackout_len() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            d.check_duplicate(&sig("slow")),
            Err(CoreError::Blackout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_on_ticks() {
        let d = dedup();
        let Admission::Leader(_hung) = d.admit(&sig("hung")).unwrap() else {
            panic!("expected leader");
        };
        let shutdown = CancellationToken::new();
        let ticker = tokio::time::interval(Duration::from_secs(10));
        let task = d.spawn_sweeper(ticker, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(d.pending_len(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(d.pending_len(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
