//! Governor
//!
//! The control loop. Each tick:
//!
//! ```text
//! probe ──▶ select ──▶ classify ──▶ debounce ──▶ Connected?  ── yes ──▶ Unlock(iface)
//!                                                            └─ no ───▶ Lock()
//! ```
//!
//! The gate is forced to Locked before the first probe. Termination requests
//! arrive on a channel checked only between ticks, so a Lock/Unlock in
//! flight always completes. On termination the governor does not lock; it
//! restores the host's pre-session firewall. On a fatal error it locks.
//!
//! # Leak check
//!
//! If no tunnel is up when the governor starts, the public address is
//! recorded before the first Lock. While unlocked, seeing that address again
//! means traffic is leaving outside the tunnel: the gate locks and stays
//! locked for that interface until it goes away.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! let mut governor = Governor::new(config, probe, gate, notifier, resolver);
//! governor.run(&rx)?; // returns after a shutdown request
//! ```

use crate::classifier::{ConnectionState, Debouncer, classify};
use crate::config::GovernorConfig;
use crate::notify::{KillSwitchEvent, Notifier};
use crate::selector::InterfaceSelector;
use crate::session::GovernorSession;
use crossbeam_channel::{Receiver, after, select};
use std::net::IpAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tunlock_firewall::{FirewallGate, GateError, GateState};
use tunlock_net::{CandidateSource, ProbeError, PublicAddressResolver};

/// Fatal governor errors
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Could not prepare firewall: {0}")]
    Prepare(#[source] GateError),

    #[error("Could not apply {target} after {attempts} attempt(s): {source}")]
    Gate {
        target: GateState,
        attempts: u32,
        #[source]
        source: GateError,
    },

    #[error("Could not restore firewall: {0}")]
    Cleanup(#[source] GateError),
}

impl GovernorError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            GovernorError::Probe(_) => 3,
            GovernorError::Prepare(_) | GovernorError::Gate { .. } | GovernorError::Cleanup(_) => 1,
        }
    }
}

/// Kill-switch governor
pub struct Governor {
    source: Box<dyn CandidateSource>,
    selector: InterfaceSelector,
    debouncer: Debouncer,
    gate: FirewallGate,
    notifier: Box<dyn Notifier>,
    resolver: Option<Box<dyn PublicAddressResolver>>,
    session: GovernorSession,
    storage: PathBuf,
    poll_interval: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
    lookup_timeout: Duration,
    cleanup_on_fatal: bool,
    leak_check: bool,
    /// Public address seen before the first Lock with no tunnel up
    exposed_address: Option<IpAddr>,
    /// Interface that leaked; held Locked while it stays selected
    quarantined: Option<String>,
    /// Interface of the current Degraded episode, once notified
    degraded_notified: Option<String>,
}

impl Governor {
    pub fn new(
        config: &GovernorConfig,
        source: Box<dyn CandidateSource>,
        gate: FirewallGate,
        notifier: Box<dyn Notifier>,
        resolver: Option<Box<dyn PublicAddressResolver>>,
    ) -> Self {
        let session = GovernorSession::new(gate.backend_name());
        Self {
            source,
            selector: InterfaceSelector::new(
                config.fingerprint(),
                config.configured_interface_name.clone(),
            ),
            debouncer: Debouncer::new(config.connect_debounce_ticks, config.fallback_debounce_ticks),
            gate,
            notifier,
            resolver,
            session,
            storage: config.ruleset_storage_path.clone(),
            poll_interval: config.poll_interval(),
            retry_attempts: config.gate_retry_attempts,
            retry_backoff: config.gate_retry_backoff(),
            lookup_timeout: Duration::from_millis(config.public_address.timeout_ms),
            cleanup_on_fatal: config.cleanup_on_fatal,
            leak_check: config.leak_check.enabled,
            exposed_address: None,
            quarantined: None,
            degraded_notified: None,
        }
    }

    pub fn session(&self) -> &GovernorSession {
        &self.session
    }

    pub fn gate_state(&self) -> Option<&GateState> {
        self.gate.state()
    }

    /// Capture the host's prior firewall state and force Locked
    pub fn start(&mut self) -> Result<(), GovernorError> {
        info!(
            "Starting governor (backend {}, poll every {:?})",
            self.gate.backend_name(),
            self.poll_interval
        );
        self.gate.begin().map_err(GovernorError::Prepare)?;
        if self.leak_check {
            self.exposed_address = self.sample_exposed_address();
        }
        self.apply(GateState::Locked)?;

        KillSwitchEvent::Engaged.send(self.notifier.as_ref());
        self.session
            .record(ConnectionState::Disconnected, self.gate.state().cloned());
        self.persist();
        Ok(())
    }

    /// One probe → classify → enforce cycle
    pub fn tick(&mut self) -> Result<(), GovernorError> {
        self.session.tick();

        let fingerprint = self.selector.fingerprint().clone();
        let candidates = self.source.candidates(&fingerprint)?;
        debug!("Tick {}: {} candidate(s)", self.session.ticks, candidates.len());

        let incumbent = self
            .gate
            .state()
            .and_then(GateState::interface)
            .map(str::to_string);
        let selection = self
            .selector
            .select_with_incumbent(&candidates, incumbent.as_deref());
        let raw = classify(&selection, &fingerprint);
        let effective = self.debouncer.observe(&raw);

        if let ConnectionState::Degraded { interface, mtu } = &effective {
            warn!(
                "{} is degraded (mtu {} != {}), locking",
                interface, mtu, fingerprint.mtu
            );
        }

        if self.quarantined.is_some()
            && effective.connected_interface() != self.quarantined.as_deref()
        {
            if let Some(iface) = self.quarantined.take() {
                info!("{} is no longer selected, lifting leak lock", iface);
            }
        }

        let previous = self.gate.state().cloned();
        let target = match effective.connected_interface() {
            Some(iface) if self.quarantined.as_deref() == Some(iface) => {
                debug!("{} leaked earlier, keeping locked", iface);
                GateState::Locked
            }
            Some(iface) => GateState::Unlocked(iface.to_string()),
            None => GateState::Locked,
        };
        self.apply(target)?;
        let mut current = self.gate.state().cloned();

        let address = self.observed_address(previous.as_ref(), current.as_ref());
        let leaked = match (&current, address) {
            (Some(GateState::Unlocked(iface)), Some(addr)) if self.exposed_address == Some(addr) => {
                Some((iface.clone(), addr))
            }
            _ => None,
        };

        match leaked {
            Some((interface, public_address)) => {
                error!(
                    "Traffic through {} leaves from the unprotected address {}, locking",
                    interface, public_address
                );
                self.apply(GateState::Locked)?;
                current = self.gate.state().cloned();
                self.quarantined = Some(interface.clone());
                KillSwitchEvent::Leak {
                    interface,
                    public_address,
                }
                .send(self.notifier.as_ref());
            }
            None => self.announce(previous.as_ref(), current.as_ref(), &effective, address),
        }

        if self.session.record(effective, current) {
            info!(
                "State: {}, gate: {}",
                self.session.connection,
                display_gate(self.session.gate.as_ref())
            );
        }
        self.persist();
        Ok(())
    }

    /// Run until a shutdown request, then restore the host firewall.
    ///
    /// On a fatal error the gate is left Locked unless `cleanup_on_fatal` is
    /// set; an unlocked ruleset never outlives the loop.
    pub fn run(&mut self, shutdown: &Receiver<()>) -> Result<(), GovernorError> {
        if let Err(e) = self.start().and_then(|()| self.poll(shutdown)) {
            error!("Fatal: {}", e);
            if self.cleanup_on_fatal {
                if let Err(cleanup) = self.gate.cleanup() {
                    error!("Cleanup after fatal error failed: {}", cleanup);
                }
            } else {
                self.fail_closed();
            }
            return Err(e);
        }

        self.shutdown()
    }

    /// Best-effort Lock before exiting on a fatal error
    fn fail_closed(&mut self) {
        if self.gate.state() != Some(&GateState::Locked) {
            if let Err(e) = self.gate.lock() {
                error!("Could not lock after fatal error: {}", e);
                return;
            }
            let connection = self.session.connection.clone();
            self.session.record(connection, self.gate.state().cloned());
            self.persist();
        }
        warn!("Leaving the locked ruleset in place; run `tunlock cleanup` to restore");
    }

    fn poll(&mut self, shutdown: &Receiver<()>) -> Result<(), GovernorError> {
        loop {
            self.tick()?;

            select! {
                recv(shutdown) -> _ => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                recv(after(self.poll_interval)) -> _ => {}
            }
        }
    }

    /// Remove the enforced ruleset and restore prior firewall enablement
    pub fn shutdown(&mut self) -> Result<(), GovernorError> {
        self.gate.cleanup().map_err(GovernorError::Cleanup)?;
        if let Err(e) = GovernorSession::clear_status(&self.storage) {
            warn!("Could not remove status file: {}", e);
        }
        info!("Governor stopped after {} tick(s)", self.session.ticks);
        Ok(())
    }

    /// Apply `target`, retrying transient gate failures
    fn apply(&mut self, target: GateState) -> Result<(), GovernorError> {
        let mut attempt = 1;
        loop {
            let result = match &target {
                GateState::Locked => self.gate.lock(),
                GateState::Unlocked(iface) => self.gate.unlock(iface),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= self.retry_attempts || source.is_permanent() => {
                    return Err(GovernorError::Gate {
                        target,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Applying {} failed (attempt {}/{}): {}",
                        target, attempt, self.retry_attempts, e
                    );
                    attempt += 1;
                    if !self.retry_backoff.is_zero() {
                        thread::sleep(self.retry_backoff);
                    }
                }
            }
        }
    }

    fn announce(
        &mut self,
        previous: Option<&GateState>,
        current: Option<&GateState>,
        effective: &ConnectionState,
        address: Option<IpAddr>,
    ) {
        let fresh_degraded = match effective {
            ConnectionState::Degraded { interface, .. } => {
                self.degraded_notified.as_deref() != Some(interface.as_str())
            }
            _ => false,
        };

        let event = match (previous, current) {
            (prev, Some(GateState::Unlocked(iface))) if prev != current => {
                Some(KillSwitchEvent::Opened {
                    interface: iface.clone(),
                    public_address: address,
                })
            }
            (Some(GateState::Unlocked(_)), Some(GateState::Locked)) => {
                Some(self.lock_event(effective))
            }
            (_, Some(GateState::Locked)) if fresh_degraded => Some(self.lock_event(effective)),
            _ => None,
        };

        if !effective.is_degraded() {
            self.degraded_notified = None;
        }
        if let Some(event) = event {
            event.send(self.notifier.as_ref());
        }
    }

    fn lock_event(&mut self, effective: &ConnectionState) -> KillSwitchEvent {
        match effective {
            ConnectionState::Degraded { interface, mtu } => {
                self.degraded_notified = Some(interface.clone());
                KillSwitchEvent::Degraded {
                    interface: interface.clone(),
                    mtu: *mtu,
                }
            }
            _ => KillSwitchEvent::Engaged,
        }
    }

    /// Public address for this tick, looked up only while unlocked: on
    /// opening, and on every tick once a leak baseline exists
    fn observed_address(
        &self,
        previous: Option<&GateState>,
        current: Option<&GateState>,
    ) -> Option<IpAddr> {
        let Some(GateState::Unlocked(_)) = current else {
            return None;
        };
        if previous != current || self.exposed_address.is_some() {
            self.public_address()
        } else {
            None
        }
    }

    fn public_address(&self) -> Option<IpAddr> {
        self.resolver
            .as_ref()
            .and_then(|r| r.resolve(self.lookup_timeout))
    }

    /// Public address of the host without a tunnel, if none is up yet
    fn sample_exposed_address(&self) -> Option<IpAddr> {
        let resolver = self.resolver.as_ref()?;
        let fingerprint = self.selector.fingerprint();

        match self.source.candidates(fingerprint) {
            Ok(candidates) => {
                let selection = self.selector.select(&candidates);
                let state = classify(&selection, fingerprint);
                if state != ConnectionState::Disconnected {
                    info!("Tunnel already present at start ({}), leak check off", state);
                    return None;
                }
            }
            Err(e) => {
                warn!("Probe before leak baseline failed, leak check off: {}", e);
                return None;
            }
        }

        let address = resolver.resolve(self.lookup_timeout);
        match address {
            Some(addr) => info!("Unprotected public address: {}", addr),
            None => warn!("Could not determine unprotected public address, leak check off"),
        }
        address
    }

    fn persist(&self) {
        if let Err(e) = self.session.write_status(&self.storage) {
            warn!("Could not write status file: {}", e);
        }
    }
}

fn display_gate(gate: Option<&GateState>) -> String {
    gate.as_ref()
        .map(|g| g.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tunlock_firewall::{PriorState, Ruleset, RulesetBackend, render_pf};
    use tunlock_net::{Eligibility, Fingerprint, InterfaceCandidate};

    /// Candidate sets to hand out, one per tick
    struct ScriptedSource {
        ticks: Arc<Mutex<VecDeque<Result<Vec<InterfaceCandidate>, ProbeError>>>>,
    }

    impl CandidateSource for ScriptedSource {
        fn candidates(&self, _fp: &Fingerprint) -> Result<Vec<InterfaceCandidate>, ProbeError> {
            self.ticks
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct Firewall {
        loaded: Vec<String>,
        fail_next: usize,
        restores: usize,
    }

    struct RecordingBackend {
        firewall: Arc<Mutex<Firewall>>,
    }

    impl RulesetBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn staged_file_name(&self) -> &'static str {
            "recording.rules"
        }

        fn render(&self, ruleset: &Ruleset) -> String {
            render_pf(ruleset)
        }

        fn load(&mut self, staged: &Path) -> Result<(), GateError> {
            let mut fw = self.firewall.lock().unwrap();
            if fw.fail_next > 0 {
                fw.fail_next -= 1;
                return Err(GateError::Timeout("pfctl -f".into()));
            }
            fw.loaded.push(std::fs::read_to_string(staged)?);
            Ok(())
        }

        fn capture_prior(&mut self) -> Result<PriorState, GateError> {
            Ok(PriorState::new("recording", false, None))
        }

        fn default_prior(&self) -> PriorState {
            PriorState::new("recording", true, None)
        }

        fn restore(&mut self, _prior: &PriorState) -> Result<(), GateError> {
            self.firewall.lock().unwrap().restores += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, body: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((title.to_string(), body.to_string()));
        }
    }

    /// Resolves to whatever the test last set
    struct FixedResolver(Arc<Mutex<Option<IpAddr>>>);

    impl PublicAddressResolver for FixedResolver {
        fn resolve(&self, _timeout: Duration) -> Option<IpAddr> {
            *self.0.lock().unwrap()
        }
    }

    struct Harness {
        governor: Governor,
        ticks: Arc<Mutex<VecDeque<Result<Vec<InterfaceCandidate>, ProbeError>>>>,
        firewall: Arc<Mutex<Firewall>>,
        notes: RecordingNotifier,
        address: Arc<Mutex<Option<IpAddr>>>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(|_| {})
        }

        fn with_config(tweak: impl FnOnce(&mut GovernorConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = GovernorConfig::default();
            config.fingerprint.name_prefix = "utun".to_string();
            config.ruleset_storage_path = dir.path().to_path_buf();
            config.gate_retry_backoff_ms = 0;
            config.poll_interval_secs = 1;
            config.leak_check.enabled = false;
            tweak(&mut config);

            let ticks = Arc::new(Mutex::new(VecDeque::new()));
            let firewall = Arc::new(Mutex::new(Firewall::default()));
            let notes = RecordingNotifier::default();
            let address = Arc::new(Mutex::new(Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))));

            let gate = FirewallGate::new(
                Box::new(RecordingBackend {
                    firewall: Arc::clone(&firewall),
                }),
                dir.path(),
                config.allowances(),
            )
            .unwrap();

            let governor = Governor::new(
                &config,
                Box::new(ScriptedSource {
                    ticks: Arc::clone(&ticks),
                }),
                gate,
                Box::new(notes.clone()),
                Some(Box::new(FixedResolver(Arc::clone(&address)))),
            );

            Self {
                governor,
                ticks,
                firewall,
                notes,
                address,
                dir,
            }
        }

        fn set_address(&self, addr: [u8; 4]) {
            *self.address.lock().unwrap() = Some(IpAddr::V4(Ipv4Addr::from(addr)));
        }

        fn push(&self, candidates: Vec<InterfaceCandidate>) {
            self.ticks.lock().unwrap().push_back(Ok(candidates));
        }

        fn titles(&self) -> Vec<String> {
            self.notes
                .sent
                .lock()
                .unwrap()
                .iter()
                .map(|(t, _)| t.clone())
                .collect()
        }

        fn loads(&self) -> Vec<String> {
            self.firewall.lock().unwrap().loaded.clone()
        }

        fn last_body(&self) -> String {
            self.notes
                .sent
                .lock()
                .unwrap()
                .last()
                .map(|(_, b)| b.clone())
                .unwrap_or_default()
        }
    }

    fn tunnel(name: &str, mtu: u32) -> InterfaceCandidate {
        InterfaceCandidate {
            name: name.to_string(),
            mtu,
            has_routable_address: true,
            associated_port: Some(51820),
            eligibility: if mtu == 1280 {
                Eligibility::Primary
            } else {
                Eligibility::FallbackOnly
            },
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2))],
        }
    }

    #[test]
    fn test_start_forces_lock_and_notifies_once() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(h.loads().len(), 1);
        assert_eq!(h.titles(), vec!["Kill switch engaged"]);
        assert!(PriorState::load(h.dir.path()).unwrap().is_some());
        assert!(GovernorSession::read_status(h.dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_no_candidates_stays_locked_quietly() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        for _ in 0..3 {
            h.push(Vec::new());
            h.governor.tick().unwrap();
            assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        }

        assert_eq!(h.governor.session().connection, ConnectionState::Disconnected);
        assert_eq!(h.titles().len(), 1);
        // Locked -> Locked never reloads
        assert_eq!(h.loads().len(), 1);
    }

    #[test]
    fn test_unlock_after_two_connected_ticks() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();
        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));

        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun7".into())));

        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();

        assert_eq!(h.loads().len(), 2);
        assert_eq!(h.titles(), vec!["Kill switch engaged", "VPN connected"]);
        let body = h.notes.sent.lock().unwrap()[1].1.clone();
        assert!(body.contains("203.0.113.7"));
    }

    #[test]
    fn test_mtu_change_on_live_tunnel_is_degraded() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun7".into())));

        h.push(vec![tunnel("utun7", 1380)]);
        h.governor.tick().unwrap();

        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(
            h.governor.session().connection,
            ConnectionState::Degraded {
                interface: "utun7".into(),
                mtu: 1380
            }
        );
        assert_eq!(
            h.titles().last().map(String::as_str),
            Some("Kill switch engaged (degraded tunnel)")
        );

        // Still degraded: no repeat notification
        h.push(vec![tunnel("utun7", 1380)]);
        h.governor.tick().unwrap();
        assert_eq!(h.titles().len(), 3);
    }

    #[test]
    fn test_disconnect_locks_immediately() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }

        h.push(Vec::new());
        h.governor.tick().unwrap();

        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(h.titles().last().map(String::as_str), Some("Kill switch engaged"));
    }

    #[test]
    fn test_no_ruleset_allows_two_interfaces() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        // utun7 disappears and utun8 holds long enough to be trusted
        for _ in 0..2 {
            h.push(vec![tunnel("utun8", 1280)]);
            h.governor.tick().unwrap();
        }

        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun8".into())));
        for text in h.loads() {
            assert!(text.matches("pass quick on").count() <= 1);
        }
    }

    #[test]
    fn test_gate_failure_exhausts_retries() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();

        h.firewall.lock().unwrap().fail_next = 3;
        h.push(vec![tunnel("utun7", 1280)]);
        let err = h.governor.tick().unwrap_err();

        assert!(matches!(err, GovernorError::Gate { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        // Only the initial Locked ruleset was ever loaded
        let loads = h.loads();
        assert_eq!(loads.len(), 1);
        assert!(!loads[0].contains("pass quick on"));
    }

    #[test]
    fn test_gate_failure_recovers_within_retries() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        h.firewall.lock().unwrap().fail_next = 2;

        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun7".into())));
    }

    #[test]
    fn test_probe_failure_is_fatal() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        h.ticks
            .lock()
            .unwrap()
            .push_back(Err(ProbeError::Enumeration("EPERM".into())));

        let err = h.governor.tick().unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_run_until_shutdown_restores_firewall() {
        let mut h = Harness::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).unwrap();

        h.governor.run(&rx).unwrap();

        // One tick ran, then shutdown restored instead of locking again
        assert_eq!(h.governor.session().ticks, 1);
        assert_eq!(h.firewall.lock().unwrap().restores, 1);
        assert!(GovernorSession::read_status(h.dir.path()).unwrap().is_none());
        assert!(PriorState::load(h.dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_fatal_error_leaves_ruleset_in_place() {
        let mut h = Harness::new();
        h.ticks
            .lock()
            .unwrap()
            .push_back(Err(ProbeError::Enumeration("EPERM".into())));
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);

        assert!(h.governor.run(&rx).is_err());
        assert_eq!(h.firewall.lock().unwrap().restores, 0);
        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
    }

    #[test]
    fn test_fatal_error_cleans_up_when_configured() {
        let mut h = Harness::with_config(|c| c.cleanup_on_fatal = true);
        h.ticks
            .lock()
            .unwrap()
            .push_back(Err(ProbeError::Enumeration("EPERM".into())));
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);

        assert!(h.governor.run(&rx).is_err());
        assert_eq!(h.firewall.lock().unwrap().restores, 1);
    }

    #[test]
    fn test_configured_fallback_needs_longer_debounce() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        // utun4 is the configured name but reports the wrong port, so it is
        // only ever a Fallback selection
        let mut fallback = tunnel("utun4", 1280);
        fallback.associated_port = Some(1194);

        for expected_locked in [true, true, false] {
            h.push(vec![fallback.clone()]);
            h.governor.tick().unwrap();
            assert_eq!(
                h.governor.gate_state() == Some(&GateState::Locked),
                expected_locked
            );
        }
    }

    #[test]
    fn test_fatal_error_while_unlocked_locks_before_exit() {
        let mut h = Harness::with_config(|c| c.connect_debounce_ticks = 1);
        h.push(vec![tunnel("utun7", 1280)]);
        h.ticks
            .lock()
            .unwrap()
            .push_back(Err(ProbeError::Enumeration("EPERM".into())));
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);

        let err = h.governor.run(&rx).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        let loads = h.loads();
        assert_eq!(loads.len(), 3);
        assert!(loads[1].contains("pass quick on utun7"));
        assert!(!loads[2].contains("pass quick on"));
        assert_eq!(h.firewall.lock().unwrap().restores, 0);

        let status = GovernorSession::read_status(h.dir.path()).unwrap().unwrap();
        assert_eq!(status.gate, Some(GateState::Locked));
    }

    #[test]
    fn test_degraded_while_locked_notifies_once() {
        let mut h = Harness::new();
        h.governor.start().unwrap();

        // utun4 is the configured name, so it is selected despite its MTU
        for _ in 0..3 {
            h.push(vec![tunnel("utun4", 1380)]);
            h.governor.tick().unwrap();
            assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        }

        assert_eq!(
            h.titles(),
            vec!["Kill switch engaged", "Kill switch engaged (degraded tunnel)"]
        );
        assert!(h.last_body().contains("utun4"));
        assert_eq!(h.loads().len(), 1);
    }

    #[test]
    fn test_degraded_on_another_interface_notifies_again() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }

        h.push(vec![tunnel("utun7", 1380)]);
        h.governor.tick().unwrap();
        assert!(h.last_body().contains("utun7"));

        h.push(vec![tunnel("utun7", 1380), tunnel("utun4", 1380)]);
        h.governor.tick().unwrap();

        assert_eq!(
            h.titles(),
            vec![
                "Kill switch engaged",
                "VPN connected",
                "Kill switch engaged (degraded tunnel)",
                "Kill switch engaged (degraded tunnel)",
            ]
        );
        assert!(h.last_body().contains("utun4"));
    }

    #[test]
    fn test_direct_switch_announces_new_interface() {
        let mut h = Harness::with_config(|c| c.connect_debounce_ticks = 1);
        h.governor.start().unwrap();

        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();
        h.push(vec![tunnel("utun8", 1280)]);
        h.governor.tick().unwrap();

        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun8".into())));
        assert_eq!(
            h.titles(),
            vec!["Kill switch engaged", "VPN connected", "VPN connected"]
        );
        assert!(h.last_body().contains("utun8"));

        // Locked, utun7, Locked, utun8
        let loads = h.loads();
        assert_eq!(loads.len(), 4);
        assert!(!loads[2].contains("pass quick on"));
    }

    #[test]
    fn test_leak_locks_and_holds_until_interface_changes() {
        let mut h = Harness::with_config(|c| c.leak_check.enabled = true);
        h.set_address([198, 51, 100, 4]);
        h.governor.start().unwrap();

        // The address never changes once utun7 is unlocked
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(h.titles(), vec!["Kill switch engaged", "VPN leak detected"]);
        assert!(h.last_body().contains("198.51.100.4"));

        // utun7 stays selected: held locked, no repeat
        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();
        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(h.titles().len(), 2);

        // A new tunnel routed properly opens normally
        h.push(Vec::new());
        h.governor.tick().unwrap();
        h.set_address([203, 0, 113, 7]);
        for _ in 0..2 {
            h.push(vec![tunnel("utun8", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun8".into())));
        assert_eq!(h.titles().last().map(String::as_str), Some("VPN connected"));
    }

    #[test]
    fn test_leak_detected_while_unlocked() {
        let mut h = Harness::with_config(|c| c.leak_check.enabled = true);
        h.set_address([198, 51, 100, 4]);
        h.governor.start().unwrap();

        h.set_address([203, 0, 113, 7]);
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun7".into())));

        h.set_address([198, 51, 100, 4]);
        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.tick().unwrap();

        assert_eq!(h.governor.gate_state(), Some(&GateState::Locked));
        assert_eq!(h.titles().last().map(String::as_str), Some("VPN leak detected"));
    }

    #[test]
    fn test_tunnel_up_at_start_skips_leak_baseline() {
        let mut h = Harness::with_config(|c| c.leak_check.enabled = true);
        h.push(vec![tunnel("utun7", 1280)]);
        h.governor.start().unwrap();

        // Same address before and after: nothing to compare against
        for _ in 0..2 {
            h.push(vec![tunnel("utun7", 1280)]);
            h.governor.tick().unwrap();
        }
        assert_eq!(h.governor.gate_state(), Some(&GateState::Unlocked("utun7".into())));
        assert_eq!(h.titles(), vec!["Kill switch engaged", "VPN connected"]);
    }

    #[test]
    fn test_status_written_every_tick() {
        let mut h = Harness::new();
        h.governor.start().unwrap();
        for _ in 0..3 {
            h.push(Vec::new());
            h.governor.tick().unwrap();
        }

        let status = GovernorSession::read_status(h.dir.path()).unwrap().unwrap();
        assert_eq!(status.ticks, 3);
        assert_eq!(status.connection, ConnectionState::Disconnected);
    }
}
