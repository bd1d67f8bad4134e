//! Integration tests for rmem
//!
//! Sessions, proxies and the resolver against an in-process registry endpoint.

use rmem::{
    Arg, ConnectionGuardian, Forward, ObjectSource, RemoteErrorKind, RmemConfig, RmemError,
    Session, SharedObject,
};
use rmem_connect::ProtocolVersion;
use rmem_service::{LoopbackNetwork, RegistryService};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HOST: &str = "localhost";

fn config(port: u16, max_retry: u32) -> RmemConfig {
    RmemConfig::new(HOST, port).with_retry(max_retry, Duration::from_millis(1))
}

fn endpoint(port: u16) -> (Arc<LoopbackNetwork>, Arc<RegistryService>) {
    let network = LoopbackNetwork::new();
    let service = network.serve(HOST, port);
    (network, service)
}

/// Remote list built through the session's builtins
fn remote_list(session: &Session, items: serde_json::Value) -> rmem::Result<Arg> {
    let list = session.rmod(Some("list"))?.call(vec![Arg::from(items)])?;
    list.to_arg()
        .ok_or_else(|| RmemError::Configuration("list() returned no object".to_string()))
}

#[test]
fn test_reachable_endpoint_needs_no_retries() -> anyhow::Result<()> {
    let (network, _service) = endpoint(1);
    let session = Session::new(config(1, 4), network.clone())?;

    let greeting = session.rmem_object("greeting", "hello")?;
    assert_eq!(greeting.call_method("upper", vec![])?.as_str(), Some("HELLO"));

    let stats = session.connection()?.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(network.connect_attempts(), 1);
    Ok(())
}

#[test]
fn test_unreachable_endpoint_attempts_and_delays() {
    let network = LoopbackNetwork::new();
    network.set_reachable(false);
    let delay = Duration::from_millis(20);

    let started = Instant::now();
    let err = Session::new(
        RmemConfig::new(HOST, 2).with_retry(2, delay),
        network.clone(),
    )
    .unwrap_err();

    assert!(matches!(err, RmemError::Connection(_)));
    assert_eq!(network.connect_attempts(), 3);
    assert!(started.elapsed() >= delay * 2);
}

#[test]
fn test_version_mismatch_fails_first_attempt() {
    let network = LoopbackNetwork::new();
    network.bind(
        HOST,
        3,
        Arc::new(RegistryService::with_version(ProtocolVersion::new(4, 2, 0))),
    );

    let err = Session::new(config(3, 4), network.clone()).unwrap_err();
    assert!(matches!(err, RmemError::VersionMismatch { .. }));
    assert_eq!(network.connect_attempts(), 1);

    let tolerant = Session::new(config(3, 4).with_ignore_version(true), network.clone());
    assert!(tolerant.is_ok());
}

#[test]
fn test_generator_runs_at_most_once() -> anyhow::Result<()> {
    let (network, _service) = endpoint(4);
    let session = Session::new(config(4, 0), network)?;
    let calls = Arc::new(AtomicUsize::new(0));

    let make = |calls: Arc<AtomicUsize>| {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arg::from(json!({"hits": 0})))
        }
    };

    let first = session.rmem_generated("stats", make(calls.clone()))?;
    let second = session.rmem_generated("stats", make(calls.clone()))?;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.rmem_get()?.remote_ref(),
        second.rmem_get()?.remote_ref()
    );
    Ok(())
}

#[test]
fn test_first_writer_wins_across_processes() -> anyhow::Result<()> {
    let (network, service) = endpoint(5);
    let process_a = Session::new(config(5, 0), network.clone())?;
    let process_b = Session::new(config(5, 0), network.clone())?;

    let a_session = process_a.clone();
    let in_a = process_a.rmem_generated("k1", move || remote_list(&a_session, json!([1, 2])))?;

    let b_session = process_b.clone();
    let in_b = process_b.rmem_generated("k1", move || remote_list(&b_session, json!([1, 2, 3])))?;

    assert_eq!(in_b.repr()?, "[1, 2]");

    in_b.call_method("append", vec![Arg::from(3)])?;
    assert_eq!(in_a.repr()?, "[1, 2, 3]");
    assert_eq!(in_b.repr()?, "[1, 2, 3]");
    assert_eq!(service.value_of("k1")?, json!([1, 2, 3]));
    Ok(())
}

#[test]
fn test_update_publishes_new_value() -> anyhow::Result<()> {
    let (network, _service) = endpoint(6);
    let writer = Session::new(config(6, 0), network.clone())?;
    let reader = Session::new(config(6, 0), network.clone())?;

    let counter = writer.rmem_object("counter", 1)?;
    let bumped = counter.add(1)?;
    assert_eq!(bumped.as_i64(), Some(2));

    // Arithmetic produced a new value; the registry still holds the old one
    let seen = reader.rmem_object("counter", 0)?;
    assert!(seen.eq(1)?);

    let published = counter.rmem_update(bumped.to_arg().unwrap_or(Arg::from(0)))?;
    assert!(seen.eq(2)?);
    assert_eq!(
        reader.connection()?.get("counter")?,
        published.remote_ref().clone()
    );
    Ok(())
}

#[test]
fn test_deleted_key_raises_key_not_found() -> anyhow::Result<()> {
    let (network, _service) = endpoint(7);
    let session = Session::new(config(7, 0), network)?;

    let doomed = session.rmem_object("doomed", json!([1]))?;
    let other_view = SharedObject::lazy(
        "doomed",
        Arc::new(session.connection()?),
        ObjectSource::Object(Arg::from(0)),
    );

    assert!(other_view.rmem_delete()?);
    assert!(!doomed.rmem_is_memoized()?);
    assert!(doomed.is_memoized_locally());

    let err = doomed.len().unwrap_err();
    assert!(matches!(err, RmemError::KeyNotFound(_)));
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::KeyNotFound));
    Ok(())
}

#[test]
fn test_unknown_module_is_resolution_error() -> anyhow::Result<()> {
    let (network, _service) = endpoint(8);
    let session = Session::new(config(8, 0), network)?;

    let err = session.rmod(Some("nonexistent_module")).unwrap_err();
    match err {
        RmemError::Resolution { module, reason } => {
            assert_eq!(module, "nonexistent_module");
            assert!(reason.contains("No module named"));
        }
        other => panic!("unexpected error: {}", other),
    }
    Ok(())
}

#[test]
fn test_blind_call_after_external_close_then_reconnect() -> anyhow::Result<()> {
    let (network, _service) = endpoint(9);
    let guardian = ConnectionGuardian::connect(
        network.clone(),
        HOST,
        9,
        config(9, 1).retry_policy(),
    )?;

    network.sever(HOST, 9);
    let err: RmemError = guardian
        .call_unguarded(|ch| ch.is_memoized("k"))
        .unwrap_err()
        .into();
    assert!(matches!(err, RmemError::Transport(_)));

    guardian.reconnect()?;
    assert!(!guardian.call_unguarded(|ch| ch.is_memoized("k"))?);
    Ok(())
}

#[test]
fn test_guarded_call_recovers_and_notifies_once() -> anyhow::Result<()> {
    let (network, _service) = endpoint(10);
    let session = Session::new(config(10, 1), network.clone())?;
    let shared = session.rmem_object("shared", json!({"n": 1}))?;

    network.sever(HOST, 10);
    let notified = AtomicUsize::new(0);
    let hook = || {
        notified.fetch_add(1, Ordering::SeqCst);
    };
    let guardian = session.connection()?;
    let memoized = guardian.call_with_hook(|ch| ch.is_memoized("shared"), Some(&hook as &dyn Fn()))?;

    assert!(memoized);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(shared.get_item("n")?.as_i64(), Some(1));
    assert_eq!(guardian.stats().recovered_calls, 1);
    Ok(())
}

static FORKED_PID: AtomicU32 = AtomicU32::new(7000);

fn forked_pid() -> u32 {
    FORKED_PID.load(Ordering::SeqCst)
}

#[test]
fn test_proxies_follow_session_across_fork() -> anyhow::Result<()> {
    let (network, _service) = endpoint(11);
    let session = Session::new(config(11, 0), network.clone())?.with_process_id(forked_pid);
    let jobs = session.rmem_object("jobs", json!([]))?;
    let parent = session.connection()?;

    FORKED_PID.store(7001, Ordering::SeqCst);
    jobs.call_method("append", vec![Arg::from("child")])?;

    let child = session.connection()?;
    assert!(!Arc::ptr_eq(&parent, &child));
    assert_eq!(network.close_calls(), 0);
    assert_eq!(jobs.repr()?, "['child']");
    Ok(())
}

#[test]
fn test_remote_lock_as_scoped_resource() -> anyhow::Result<()> {
    let (network, _service) = endpoint(12);
    let session = Session::new(config(12, 0), network)?;

    let lock_type = session.rmod(Some("threading"))?.getattr("Lock")?;
    let lock = session.rmem_generated("lock", move || {
        let lock_type = lock_type
            .into_object()
            .ok_or_else(|| RmemError::Configuration("Lock is not callable".to_string()))?;
        let created = lock_type.call(vec![])?;
        created
            .to_arg()
            .ok_or_else(|| RmemError::Configuration("Lock() returned nothing".to_string()))
    })?;

    let held_inside = lock.scoped(|_| lock.call_method("locked", vec![]))?;
    assert_eq!(held_inside.as_bool(), Some(true));
    assert_eq!(lock.call_method("locked", vec![])?.as_bool(), Some(false));

    // exit still runs when the body fails
    let failed: rmem::Result<()> =
        lock.scoped(|_| Err(RmemError::Configuration("body failed".to_string())));
    assert!(failed.is_err());
    assert_eq!(lock.call_method("locked", vec![])?.as_bool(), Some(false));
    Ok(())
}

#[test]
fn test_operators_forward_to_remote_semantics() -> anyhow::Result<()> {
    let (network, _service) = endpoint(13);
    let session = Session::new(config(13, 0), network)?;

    let n = session.rmem_object("n", 7)?;
    assert_eq!(n.floordiv(2)?.as_i64(), Some(3));
    assert_eq!(n.rem(-2)?.as_i64(), Some(-1));
    assert_eq!(n.truediv(2)?.as_f64(), Some(3.5));
    assert!(n.gt(6.5)?);
    assert_eq!(n.hash()?, session.rmem_object("n_float", 7.0)?.hash()?);

    let err = n.truediv(0).unwrap_err();
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::ZeroDivision));

    let words = session.rmem_object("words", json!(["a", "b"]))?;
    assert!(words.contains("a")?);
    assert_eq!(words.len()?, 2);
    let joined = words.add(json!(["c"]))?;
    assert_eq!(joined.as_object().map(|o| o.type_name().to_string()), Some("list".to_string()));
    let items: Vec<String> = words
        .iter()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    assert_eq!(items, vec!["a", "b"]);
    Ok(())
}

#[test]
fn test_memoize_again_after_delete() -> anyhow::Result<()> {
    let (network, service) = endpoint(14);
    let session = Session::new(config(14, 0), network)?;

    let jobs = session.rmem_object("jobs", json!([1]))?;
    assert!(jobs.rmem_delete()?);
    assert!(matches!(jobs.len().unwrap_err(), RmemError::KeyNotFound(_)));

    let again = jobs.rmem_memoize(ObjectSource::Object(Arg::from(json!([7, 8]))))?;
    assert_eq!(again.type_name(), "list");
    assert_eq!(jobs.len()?, 2);
    assert_eq!(service.value_of("jobs")?, json!([7, 8]));

    // While the key is mapped the first writer still wins
    let kept = jobs.rmem_memoize(ObjectSource::Object(Arg::from(json!([]))))?;
    assert_eq!(kept.remote_ref(), again.remote_ref());

    // A generator can map it again too
    assert!(jobs.rmem_delete()?);
    jobs.rmem_memoize(ObjectSource::generator(|| Ok(Arg::from(json!(["fresh"])))))?;
    assert_eq!(jobs.repr()?, "['fresh']");
    Ok(())
}

#[test]
fn test_generator_keeps_key_while_others_memoize() -> anyhow::Result<()> {
    let (network, service) = endpoint(15);
    let creator = Session::new(config(15, 0), network.clone())?;
    let rival = Session::new(config(15, 0), network.clone())?;
    let rival_calls = Arc::new(AtomicUsize::new(0));

    let rival_in = rival.clone();
    let calls_in = rival_calls.clone();
    let builder = creator.clone();
    let created = creator.rmem_generated("k", move || {
        // Another process reaches the key while this generator is running
        let plain = rival_in.rmem_object("k", json!([9]))?;
        let generated = rival_in.rmem_generated("k", move || {
            calls_in.fetch_add(1, Ordering::SeqCst);
            Ok(Arg::from(json!([8])))
        })?;
        assert!(plain.is_memoized_locally());
        assert!(generated.is_memoized_locally());
        remote_list(&builder, json!([1, 2]))
    })?;

    assert_eq!(rival_calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.value_of("k")?, json!([1, 2]));
    assert_eq!(created.repr()?, "[1, 2]");
    assert_eq!(rival.rmem_object("k", json!([9]))?.repr()?, "[1, 2]");
    Ok(())
}

#[test]
fn test_bound_method_handles_are_stable() -> anyhow::Result<()> {
    let (network, _service) = endpoint(16);
    let session = Session::new(config(16, 0), network)?;
    let jobs = session.rmem_object("jobs", json!([]))?;

    let first = jobs.getattr("append")?;
    let second = jobs.getattr("append")?;
    let first = first.as_object().map(|o| o.remote_ref().clone());
    assert!(first.is_some());
    assert_eq!(first, second.as_object().map(|o| o.remote_ref().clone()));
    Ok(())
}

#[test]
fn test_lazy_generator_waits_for_first_operation() -> anyhow::Result<()> {
    let (network, _service) = endpoint(17);
    let session = Session::new(config(17, 0), network)?;
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let builder = session.clone();
    let later = SharedObject::lazy(
        "later",
        Arc::new(session.connection()?),
        ObjectSource::generator(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            remote_list(&builder, json!(["a"]))
        }),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!later.is_memoized_locally());
    assert!(!later.rmem_is_memoized()?);

    assert_eq!(later.len()?, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(later.is_memoized_locally());

    assert_eq!(later.repr()?, "['a']");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_update_with_publishes_generated_value() -> anyhow::Result<()> {
    let (network, service) = endpoint(18);
    let writer = Session::new(config(18, 0), network.clone())?;
    let reader = Session::new(config(18, 0), network.clone())?;

    let stats = writer.rmem_object("stats", json!({"hits": 1}))?;
    let seen = reader.rmem_object("stats", json!({}))?;

    let published = stats.rmem_update_with(|| Ok(Arg::from(json!({"hits": 5}))))?;
    assert_eq!(service.value_of("stats")?, json!({"hits": 5}));
    assert_eq!(seen.get_item("hits")?.as_i64(), Some(5));
    assert_eq!(
        reader.connection()?.get("stats")?,
        published.remote_ref().clone()
    );

    // A failing generator leaves the published value alone
    let err = stats
        .rmem_update_with(|| Err(RmemError::Configuration("no data".to_string())))
        .unwrap_err();
    assert!(matches!(err, RmemError::Configuration(_)));
    assert_eq!(service.value_of("stats")?, json!({"hits": 5}));
    Ok(())
}

#[test]
fn test_failing_generator_leaves_key_free() -> anyhow::Result<()> {
    let (network, service) = endpoint(19);
    let session = Session::new(config(19, 0), network)?;

    let broken = SharedObject::lazy(
        "broken",
        Arc::new(session.connection()?),
        ObjectSource::generator(|| Err(RmemError::Configuration("generator failed".to_string()))),
    );

    let err = broken.len().unwrap_err();
    assert!(matches!(&err, RmemError::Configuration(m) if m.contains("generator failed")));
    assert!(!broken.is_memoized_locally());
    assert!(!broken.rmem_is_memoized()?);
    assert!(!service.is_memoized("broken"));

    // The generator is spent, so there is nothing left to memoize
    let err = broken.len().unwrap_err();
    assert!(matches!(&err, RmemError::Configuration(m) if m.contains("no object left")));

    // Once another writer maps the key the proxy follows it
    let other = session.rmem_generated("broken", || Ok(Arg::from(json!([3]))))?;
    assert_eq!(other.len()?, 1);
    assert_eq!(broken.len()?, 1);
    assert!(broken.is_memoized_locally());
    Ok(())
}

#[test]
fn test_relative_module_resolves_against_package() -> anyhow::Result<()> {
    let (network, _service) = endpoint(20);
    let session = Session::new(config(20, 0), network)?;

    let threading = session.rmod_in(".", Some("threading"))?;
    assert_eq!(threading.repr()?, "<module 'threading'>");
    assert_eq!(
        threading.remote_ref(),
        session.rmod(Some("threading"))?.remote_ref()
    );

    let err = session.rmod_in(".threading", None).unwrap_err();
    assert!(matches!(err, RmemError::Resolution { .. }));
    Ok(())
}
