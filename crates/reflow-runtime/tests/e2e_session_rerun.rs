#![forbid(unsafe_code)]

//! End-to-end session tests: real script threads, the shared cache, and the
//! transport-facing flush.
//!
//! Run:
//!   cargo test -p reflow-runtime --test e2e_session_rerun

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reflow_core::{
    Delta, Element, ForwardMsg, ForwardMsgKind, ScriptFinishedStatus, WidgetStates, WidgetValue,
};
use reflow_runtime::{
    AppSession, AppSessionState, ForwardMsgCache, RerunData, RunOutcome, RuntimeConfig,
    ScriptContext, ScriptError, ScriptRunnerEvent, WidgetMetadata, script_fn,
};
use web_time::Instant;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

fn config(max_age: u64) -> RuntimeConfig {
    RuntimeConfig::new(max_age).with_min_cached_message_size(500)
}

/// Poll runner events until one matches; returns everything seen.
fn wait_for_event(
    session: &mut AppSession,
    wanted: impl Fn(&ScriptRunnerEvent) -> bool,
) -> Vec<ScriptRunnerEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    loop {
        for event in session.poll_events() {
            let done = wanted(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        assert!(Instant::now() < deadline, "timed out; events so far: {seen:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_shutdown(session: &mut AppSession) -> Vec<ScriptRunnerEvent> {
    wait_for_event(session, |e| *e == ScriptRunnerEvent::Shutdown)
}

/// Start a run and wait for the script thread to go idle.
fn run(session: &mut AppSession, query: &str, widgets: Option<WidgetStates>) -> Vec<ForwardMsg> {
    session
        .request_rerun(Some(RerunData::new(query, widgets)))
        .unwrap();
    wait_for_shutdown(session);
    session.flush_outgoing()
}

fn finished_statuses(msgs: &[ForwardMsg]) -> Vec<ScriptFinishedStatus> {
    msgs.iter().filter_map(ForwardMsg::script_finished_status).collect()
}

fn elements(msgs: &[ForwardMsg]) -> Vec<&Element> {
    msgs.iter()
        .filter_map(|m| match &m.kind {
            ForwardMsgKind::Delta(Delta::NewElement(element)) => Some(element),
            _ => None,
        })
        .collect()
}

fn big_payload() -> String {
    "lorem ipsum ".repeat(200)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn simple_run_delivers_framed_output() {
    let script = script_fn("hello", |ctx| {
        let main = ScriptContext::main();
        ctx.text(&main, "hello")?;
        ctx.text(&main, ctx.query_string().to_owned())?;
        Ok(())
    });
    let cache = Arc::new(ForwardMsgCache::new(2));
    let mut session = AppSession::new(Arc::new(script), cache, config(2));

    let msgs = run(&mut session, "name=ada", None);
    let names: Vec<&str> = msgs.iter().map(|m| m.kind.name()).collect();
    assert_eq!(
        names,
        vec![
            "new_session",
            "session_status_changed",
            "new_element",
            "new_element",
            "script_finished",
            "session_status_changed",
        ]
    );
    assert_eq!(
        elements(&msgs)[1],
        &Element::Text {
            body: "name=ada".into()
        }
    );
    assert_eq!(session.script_run_count(), 1);
    assert_eq!(session.state(), AppSessionState::AppNotRunning);
}

#[test]
fn rerun_interrupts_spinning_script() {
    let script = script_fn("spinner", |ctx| {
        ctx.text(&ScriptContext::main(), "start")?;
        if ctx.query_string() == "fast" {
            return Ok(());
        }
        loop {
            ctx.checkpoint()?;
            thread::yield_now();
        }
    });
    let mut session = AppSession::new(
        Arc::new(script),
        Arc::new(ForwardMsgCache::new(1)),
        config(1),
    );

    session
        .request_rerun(Some(RerunData::new("slow", None)))
        .unwrap();
    wait_for_event(&mut session, |e| {
        matches!(e, ScriptRunnerEvent::ScriptStarted { .. })
    });
    session
        .request_rerun(Some(RerunData::new("fast", None)))
        .unwrap();

    let events = wait_for_shutdown(&mut session);
    let outcomes: Vec<RunOutcome> = events
        .iter()
        .filter_map(|e| match e {
            ScriptRunnerEvent::ScriptStopped { outcome, .. } => Some(*outcome),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![RunOutcome::ForRerun, RunOutcome::Success]);

    let msgs = session.flush_outgoing();
    assert_eq!(
        finished_statuses(&msgs),
        vec![
            ScriptFinishedStatus::FinishedEarlyForRerun,
            ScriptFinishedStatus::FinishedSuccessfully
        ]
    );
    // The interrupted run's element was dropped by the retained clear.
    assert_eq!(elements(&msgs).len(), 1);
    assert_eq!(session.script_run_count(), 2);
}

#[test]
fn stop_then_rerun_respawns_runner() {
    let script = script_fn("spinner", |ctx| {
        if ctx.query_string() == "fast" {
            return Ok(());
        }
        loop {
            ctx.checkpoint()?;
            thread::yield_now();
        }
    });
    let mut session = AppSession::new(
        Arc::new(script),
        Arc::new(ForwardMsgCache::new(1)),
        config(1),
    );

    session
        .request_rerun(Some(RerunData::new("slow", None)))
        .unwrap();
    wait_for_event(&mut session, |e| {
        matches!(e, ScriptRunnerEvent::ScriptStarted { .. })
    });
    session.request_stop();
    let events = wait_for_shutdown(&mut session);
    assert!(events.iter().any(|e| matches!(
        e,
        ScriptRunnerEvent::ScriptStopped {
            outcome: RunOutcome::Stopped,
            ..
        }
    )));
    assert_eq!(session.state(), AppSessionState::AppNotRunning);

    let msgs = run(&mut session, "fast", None);
    assert_eq!(
        finished_statuses(&msgs).last(),
        Some(&ScriptFinishedStatus::FinishedSuccessfully)
    );
}

#[test]
fn script_errors_and_panics_become_exception_elements() {
    let script = script_fn("fragile", |ctx| {
        let main = ScriptContext::main();
        ctx.text(&main, "before")?;
        match ctx.query_string() {
            "error" => Err(ScriptError::failed("bad input")),
            "panic" => panic!("kaboom"),
            _ => {
                ctx.text(&main, "fine")?;
                Ok(())
            }
        }
    });
    let mut session = AppSession::new(
        Arc::new(script),
        Arc::new(ForwardMsgCache::new(1)),
        config(1),
    );

    let msgs = run(&mut session, "error", None);
    let shown = elements(&msgs);
    assert!(matches!(
        shown[1],
        Element::Exception { type_name, message, .. }
            if type_name == "ScriptError" && message == "bad input"
    ));
    let exception_path = msgs
        .iter()
        .find(|m| matches!(m.kind, ForwardMsgKind::Delta(Delta::NewElement(Element::Exception { .. }))))
        .map(|m| m.metadata.delta_path.as_slice().to_vec());
    assert_eq!(exception_path, Some(vec![0, 1]));

    let msgs = run(&mut session, "panic", None);
    assert!(elements(&msgs).iter().any(|e| matches!(
        e,
        Element::Exception { type_name, message, .. } if type_name == "Panic" && message == "kaboom"
    )));

    let msgs = run(&mut session, "ok", None);
    assert_eq!(
        elements(&msgs),
        vec![
            &Element::Text {
                body: "before".into()
            },
            &Element::Text {
                body: "fine".into()
            }
        ]
    );
    assert_eq!(session.script_run_count(), 3);
}

// ============================================================================
// Session state and widgets
// ============================================================================

#[test]
fn session_state_survives_reruns() {
    let script = script_fn("counter", |ctx| {
        let count = ctx
            .session_state()
            .try_get("count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        ctx.session_state().set("count", count + 1)?;
        ctx.text(&ScriptContext::main(), format!("count={}", count + 1))?;
        Ok(())
    });
    let mut session = AppSession::new(
        Arc::new(script),
        Arc::new(ForwardMsgCache::new(1)),
        config(1),
    );

    for _ in 0..3 {
        run(&mut session, "", None);
    }
    let state = session.session_state();
    assert_eq!(state.get("count").unwrap(), serde_json::json!(3));
    assert!(!state.is_new_value("count"));
}

#[test]
fn widget_callbacks_fire_when_client_value_changes() {
    let script = script_fn("form", |ctx| {
        let main = ScriptContext::main();
        let checked = ctx.widget(
            &main,
            "Subscribe",
            WidgetMetadata::new("subscribe", WidgetValue::Bool(false))
                .with_key("subscribed")
                .with_on_change(|state| {
                    let changes = state
                        .try_get("changes")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    let _ = state.set("changes", changes + 1);
                }),
        )?;
        ctx.text(&main, format!("subscribed={checked:?}"))?;
        Ok(())
    });
    let mut session = AppSession::new(
        Arc::new(script),
        Arc::new(ForwardMsgCache::new(1)),
        config(1),
    );
    let checked = || Some(WidgetStates::new().with("subscribe", WidgetValue::Bool(true)));

    run(&mut session, "", None);
    assert!(session.session_state().try_get("changes").is_none());

    run(&mut session, "", checked());
    assert_eq!(session.session_state().get("changes").unwrap(), serde_json::json!(1));
    assert_eq!(
        session.session_state().get("subscribed").unwrap(),
        serde_json::json!(true)
    );

    run(&mut session, "", checked());
    assert_eq!(session.session_state().get("changes").unwrap(), serde_json::json!(1));
}

// ============================================================================
// Message cache
// ============================================================================

#[test]
fn second_run_receives_reference_message() {
    let payload = big_payload();
    let script = script_fn("report", move |ctx| {
        ctx.element(
            &ScriptContext::main(),
            Element::Markdown {
                body: payload.clone(),
                allow_html: false,
            },
        )?;
        Ok(())
    });
    let cache = Arc::new(ForwardMsgCache::new(2));
    let mut session = AppSession::new(Arc::new(script), Arc::clone(&cache), config(2));

    let first = run(&mut session, "", None);
    let full = first
        .iter()
        .find(|m| m.as_delta().is_some())
        .unwrap();
    assert!(full.metadata.cacheable);
    assert!(full.hash.is_some());
    assert_eq!(cache.len(), 1);

    let second = run(&mut session, "", None);
    let reference = second
        .iter()
        .find(|m| m.metadata.delta_path.len() == 2)
        .unwrap();
    assert!(reference.is_reference());
    assert_eq!(reference.metadata.delta_path, full.metadata.delta_path);
    match &reference.kind {
        ForwardMsgKind::RefHash(hash) => {
            let cached = cache.get_message(hash).unwrap();
            assert_eq!(cached.kind, full.kind);
        }
        other => panic!("expected reference, got {other:?}"),
    }
    assert_eq!(cache.len(), 1);
}

#[test]
fn sessions_share_one_copy_and_release_on_shutdown() {
    let payload = big_payload();
    let make_script = || {
        let payload = payload.clone();
        Arc::new(script_fn("shared", move |ctx| {
            ctx.element(
                &ScriptContext::main(),
                Element::Markdown {
                    body: payload.clone(),
                    allow_html: false,
                },
            )?;
            Ok(())
        }))
    };
    let cache = Arc::new(ForwardMsgCache::new(2));
    let mut a = AppSession::new(make_script(), Arc::clone(&cache), config(2));
    let mut b = AppSession::new(make_script(), Arc::clone(&cache), config(2));

    run(&mut a, "", None);
    run(&mut b, "", None);
    assert_eq!(cache.len(), 1);
    let stats = cache.get_stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].byte_length >= 500);

    a.shutdown().unwrap();
    assert_eq!(a.state(), AppSessionState::ShutdownRequested);
    assert_eq!(cache.len(), 1);

    b.shutdown().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn references_expire_after_max_age_runs() {
    let payload = big_payload();
    let script = script_fn("sometimes", move |ctx| {
        if ctx.query_string() == "with" {
            ctx.element(
                &ScriptContext::main(),
                Element::Markdown {
                    body: payload.clone(),
                    allow_html: false,
                },
            )?;
        }
        Ok(())
    });
    let cache = Arc::new(ForwardMsgCache::new(1));
    let mut session = AppSession::new(Arc::new(script), Arc::clone(&cache), config(1));

    run(&mut session, "with", None);
    assert_eq!(cache.len(), 1);

    run(&mut session, "without", None);
    assert!(cache.is_empty());

    // The payload is sent in full again once its reference has expired.
    let msgs = run(&mut session, "with", None);
    assert!(msgs.iter().any(|m| m.as_delta().is_some() && !m.is_reference()));
}
