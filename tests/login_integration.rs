//! Login integration tests
//!
//! Authentication through the orchestrator against scripted collaborators.

mod common;

use common::{alice, config_with_dirs, harness, RecordingOps, ScriptedBackend};
use lamco_login::audit::AuditOutcome;
use lamco_login::backend::BackendStatus;
use lamco_login::{AuthResult, LaunchResult, LoginError, SessionId};
use proptest::prelude::*;

fn empty_config() -> (tempfile::TempDir, lamco_login::config::LoginConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_dirs(&[dir.path()]);
    (dir, config)
}

#[test]
fn test_wrong_password_is_rejected_and_audited() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    let result = h.orchestrator.authenticate("alice", "wrong");

    assert!(matches!(result, AuthResult::Rejected(_)));
    assert!(!h.orchestrator.is_authenticated());

    let logins = h.audit.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].username, "alice");
    assert!(logins[0].to_string().contains("success=no"));

    // Account check never ran; transaction still torn down
    assert_eq!(
        h.backend.events(),
        vec!["start:alice", "verify", "end:AuthError"]
    );
}

#[test]
fn test_correct_password_then_failsafe_launch() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    let result = h.orchestrator.authenticate("alice", "correct");
    assert_eq!(result, AuthResult::Authenticated(alice()));
    assert_eq!(h.orchestrator.identity(), Some(&alice()));

    let sessions = h.orchestrator.available_sessions();
    assert_eq!(sessions, vec![SessionId::from("failsafe")]);

    let launched = h.orchestrator.launch(&sessions[0]);
    assert_eq!(launched, LaunchResult::Launched);

    assert_eq!(
        h.ops.step_names(),
        vec!["fork", "initgroups", "setgid", "setuid", "chdir", "exec"]
    );
    assert_eq!(h.ops.exec_argv.lock().clone(), vec!["-bash"]);
    assert!(h.orchestrator.has_active_sessions());

    let logins = h.audit.logins();
    assert_eq!(logins.len(), 1);
    assert!(logins[0].is_success());
}

#[test]
fn test_expired_account_is_account_invalid() {
    let (_dir, config) = empty_config();
    let mut backend = ScriptedBackend::accepting("correct");
    backend.account_status = BackendStatus::AccountExpired;
    let mut h = harness(&config, backend, RecordingOps::default());

    let result = h.orchestrator.authenticate("alice", "correct");

    assert!(matches!(result, AuthResult::AccountInvalid(_)));
    assert!(!h.orchestrator.is_authenticated());
    assert_eq!(
        h.backend.events(),
        vec!["start:alice", "verify", "account", "end:AccountExpired"]
    );
}

#[test]
fn test_unavailable_backend_is_backend_error() {
    let (_dir, config) = empty_config();
    let mut backend = ScriptedBackend::accepting("correct");
    backend.start_status = BackendStatus::ServiceError;
    let mut h = harness(&config, backend, RecordingOps::default());

    let result = h.orchestrator.authenticate("alice", "correct");

    assert!(matches!(result, AuthResult::BackendError(_)));
    assert_eq!(h.audit.logins().len(), 1);
}

#[test]
fn test_username_with_line_break_is_input_error() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    let result = h.orchestrator.authenticate(
        "mallory\n2024-05-01T12:30:00Z Login attempt: user=root success=yes",
        "correct",
    );

    assert!(matches!(result, AuthResult::InputError(_)));
    assert!(h.backend.events().is_empty());

    let logins = h.audit.logins();
    assert_eq!(logins.len(), 1);
    assert!(!logins[0].is_success());
    assert_eq!(logins[0].to_string().lines().count(), 1);
}

#[test]
fn test_failed_attempt_clears_previous_identity() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    assert!(h.orchestrator.authenticate("alice", "correct").is_authenticated());
    assert!(h.orchestrator.is_authenticated());

    assert!(!h.orchestrator.authenticate("alice", "wrong").is_authenticated());
    assert!(!h.orchestrator.is_authenticated());

    let launched = h.orchestrator.launch(&SessionId::from("failsafe"));
    assert_eq!(
        launched,
        LaunchResult::LaunchFailed(LoginError::NotAuthenticated)
    );
    assert!(h.ops.steps().is_empty());
}

#[test]
fn test_logout_closes_sessions() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    h.orchestrator.authenticate("alice", "correct");
    assert!(h.orchestrator.launch(&SessionId::from("failsafe")).is_launched());

    h.orchestrator.logout();

    assert!(!h.orchestrator.is_authenticated());
    assert!(!h.orchestrator.has_active_sessions());
    assert_eq!(h.backend.count("close_session"), 1);
}

#[test]
fn test_reap_closes_exited_sessions() {
    let (_dir, config) = empty_config();
    let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

    h.orchestrator.authenticate("alice", "correct");
    h.orchestrator.launch(&SessionId::from("failsafe"));

    assert_eq!(h.orchestrator.reap_sessions(), 0);
    assert_eq!(h.backend.count("close_session"), 0);

    let pid = h.orchestrator.active_sessions()[0].pid;
    h.ops.mark_exited(pid);

    assert_eq!(h.orchestrator.reap_sessions(), 1);
    assert!(!h.orchestrator.has_active_sessions());
    assert_eq!(h.backend.count("close_session"), 1);

    // Identity survives the session until logout
    assert!(h.orchestrator.is_authenticated());
}

#[test]
fn test_drop_closes_sessions() {
    let (_dir, config) = empty_config();
    let h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());
    let backend = h.backend.clone();
    let mut orchestrator = h.orchestrator;

    orchestrator.authenticate("alice", "correct");
    orchestrator.launch(&SessionId::from("failsafe"));
    drop(orchestrator);

    assert_eq!(backend.count("close_session"), 1);
}

proptest! {
    #[test]
    fn prop_empty_input_never_reaches_backend(
        username in "[a-z]{0,8}",
        password in "[ -~]{0,8}",
    ) {
        prop_assume!(username.is_empty() || password.is_empty());

        let (_dir, config) = empty_config();
        let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

        let result = h.orchestrator.authenticate(&username, &password);

        prop_assert!(matches!(result, AuthResult::InputError(_)));
        prop_assert!(h.backend.events().is_empty());
        prop_assert_eq!(h.audit.logins().len(), 1);
    }

    #[test]
    fn prop_one_audit_record_per_attempt(
        attempts in proptest::collection::vec(
            (prop_oneof!["alice", ""], prop_oneof!["correct", "wrong", ""]),
            1..6,
        ),
    ) {
        let (_dir, config) = empty_config();
        let mut h = harness(&config, ScriptedBackend::accepting("correct"), RecordingOps::default());

        for (user, pass) in &attempts {
            h.orchestrator.authenticate(user, pass);
        }

        let logins = h.audit.logins();
        prop_assert_eq!(logins.len(), attempts.len());
        for (entry, (user, pass)) in logins.iter().zip(&attempts) {
            let expect_success = user == "alice" && pass == "correct";
            prop_assert_eq!(entry.is_success(), expect_success);
            prop_assert!(matches!(entry.outcome, AuditOutcome::Login { .. }), "expected a Login outcome");
        }
    }
}
