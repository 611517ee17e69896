//! End-to-end turns over an in-process bus with the dispatcher and skill manager running.

use alice_bus::{BusClient, Envelope, MessageBus};
use alice_core::messages;
use alice_core::{AliceConfig, DispatchConfig, Engine};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn start(config: AliceConfig) -> Arc<MessageBus> {
    let bus = MessageBus::new(config.bus.clone()).unwrap();
    let engine = Engine::new(&config);
    engine
        .dispatcher(&config)
        .spawn(bus.connect_local("dispatcher", messages::DISPATCHER_SUBSCRIPTIONS).unwrap());
    engine
        .skill_manager(&config)
        .spawn(bus.connect_local("skills", messages::SKILL_MANAGER_SUBSCRIPTIONS).unwrap());
    bus
}

fn fast_config() -> AliceConfig {
    AliceConfig {
        dispatch: DispatchConfig {
            sweep_interval_ms: 20,
            ..DispatchConfig::default()
        },
        ..AliceConfig::default()
    }
}

async fn wait_for<F>(client: &BusClient, mut predicate: F) -> Envelope
where
    F: FnMut(&Envelope) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match client.recv_timeout(remaining).await {
            Some(envelope) if predicate(&envelope) => return envelope,
            Some(_) => continue,
            None => panic!("timed out waiting on {}", client.id()),
        }
    }
}

/// Wait until a handler failure and the skill's move to failed were both seen, in either order.
async fn failure_and_state(observer: &BusClient, skill_id: &str) -> Envelope {
    let mut failure = None;
    let mut failed_state = false;
    while failure.is_none() || !failed_state {
        let envelope = wait_for(observer, |_| true).await;
        if envelope.msg_type == messages::HANDLER_FAILED {
            failure = Some(envelope);
        } else if is_state(&envelope, skill_id, "failed") {
            failed_state = true;
        }
    }
    failure.unwrap()
}

fn is_state(envelope: &Envelope, skill_id: &str, to: &str) -> bool {
    envelope.msg_type == messages::SKILL_STATE
        && envelope.str_field("skill_id") == Some(skill_id)
        && envelope.str_field("to") == Some(to)
}

/// Connect a skill, register its intents and wait until it is routable.
async fn skill(bus: &Arc<MessageBus>, skill_id: &str, intents: Value) -> BusClient {
    let client = bus
        .connect_local(
            skill_id,
            [
                format!("{}:*", skill_id),
                messages::CONVERSE_REQUEST.to_string(),
                messages::FALLBACK_REQUEST.to_string(),
                messages::SKILL_STATE.to_string(),
            ],
        )
        .unwrap();
    client
        .publish(
            Envelope::new(messages::REGISTER_INTENTS)
                .with_data(json!({ "skill_id": skill_id, "intents": intents })),
        )
        .unwrap();
    wait_for(&client, |e| is_state(e, skill_id, "active")).await;
    client
}

async fn fallback_skill(bus: &Arc<MessageBus>, skill_id: &str, priority: i64) -> BusClient {
    let client = bus
        .connect_local(skill_id, [messages::FALLBACK_REQUEST, messages::SKILL_STATE])
        .unwrap();
    client
        .publish(
            Envelope::new(messages::FALLBACK_REGISTER)
                .with_data(json!({ "skill_id": skill_id, "priority": priority })),
        )
        .unwrap();
    wait_for(&client, |e| is_state(e, skill_id, "active")).await;
    client
}

fn weather_intents() -> Value {
    json!([{ "name": "current", "vocabulary": ["what's the weather", "weather"], "priority": 50 }])
}

fn timer_intents() -> Value {
    json!([{ "name": "set", "vocabulary": ["set a timer"], "priority": 50 }])
}

fn utterance(text: &str, session_id: &str) -> Envelope {
    Envelope::new(messages::UTTERANCE)
        .with_session(session_id)
        .with_data(json!({ "utterances": [text], "lang": "en-us" }))
}

fn complete(invocation: &Envelope, extra: Value) -> Envelope {
    let mut data = json!({ "invocation_id": invocation.str_field("invocation_id") });
    if let (Some(target), Value::Object(extra)) = (data.as_object_mut(), extra) {
        target.extend(extra);
    }
    Envelope::new(messages::HANDLER_COMPLETE)
        .with_session(invocation.session_id().unwrap_or_default())
        .with_data(data)
}

#[tokio::test]
async fn matched_utterance_reaches_skill_and_reply_keeps_session() {
    let bus = start(fast_config());
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let audio = bus.connect_local("audio", [messages::SPEAK]).unwrap();

    capture.publish(utterance("What's the weather?", "s1")).unwrap();

    let invocation = wait_for(&weather, |e| e.msg_type == "weather-skill:current").await;
    assert_eq!(invocation.session_id(), Some("s1"));
    assert_eq!(invocation.str_field("lang"), Some("en-us"));
    assert!(invocation.data["confidence"].as_f64().unwrap() >= 0.5);

    weather
        .publish(
            Envelope::new(messages::SPEAK)
                .with_session(invocation.session_id().unwrap_or_default())
                .with_data(json!({ "utterance": "Sunny." })),
        )
        .unwrap();
    weather.publish(complete(&invocation, json!({}))).unwrap();

    let spoken = wait_for(&audio, |e| e.msg_type == messages::SPEAK).await;
    assert_eq!(spoken.session_id(), Some("s1"));
    assert_eq!(spoken.str_field("utterance"), Some("Sunny."));
}

#[tokio::test]
async fn expected_response_routes_follow_up_to_same_skill() {
    let bus = start(fast_config());
    let timer = skill(&bus, "timer-skill", timer_intents()).await;
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();

    capture.publish(utterance("set a timer", "s1")).unwrap();
    let first = wait_for(&timer, |e| e.msg_type == "timer-skill:set").await;
    timer
        .publish(complete(&first, json!({ "expect_response": true, "frame": { "ask": "duration" } })))
        .unwrap();

    // Give the dispatcher a moment to record the continuation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    capture.publish(utterance("weather", "s1")).unwrap();
    let follow_up = wait_for(&timer, |e| e.msg_type == messages::CONVERSE_REQUEST).await;
    assert_eq!(follow_up.str_field("utterance"), Some("weather"));
    assert_eq!(follow_up.data["frame"]["ask"], "duration");
    timer.publish(complete(&follow_up, json!({}))).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    capture.publish(utterance("weather", "s1")).unwrap();
    let fresh = wait_for(&weather, |e| e.msg_type == "weather-skill:current").await;
    assert_eq!(fresh.session_id(), Some("s1"));
}

#[tokio::test]
async fn unmatched_utterance_walks_fallbacks_then_fails() {
    let bus = start(fast_config());
    let first = fallback_skill(&bus, "unknown-skill", 10).await;
    let second = fallback_skill(&bus, "wolfram-skill", 20).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let observer = bus.connect_local("observer", [messages::INTENT_FAILURE]).unwrap();

    capture.publish(utterance("why is the sky blue", "s9")).unwrap();

    for handler in [&first, &second] {
        let request = wait_for(handler, |e| e.msg_type == messages::FALLBACK_REQUEST).await;
        handler
            .publish(Envelope::new(messages::FALLBACK_RESPONSE).with_data(json!({
                "invocation_id": request.str_field("invocation_id"),
                "handled": false,
            })))
            .unwrap();
    }

    let failure = wait_for(&observer, |e| e.msg_type == messages::INTENT_FAILURE).await;
    assert_eq!(failure.session_id(), Some("s9"));
    assert_eq!(failure.str_field("utterance"), Some("why is the sky blue"));
}

#[tokio::test]
async fn failed_skill_is_excluded_from_matching() {
    let bus = start(fast_config());
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let observer = bus.connect_local("observer", [messages::INTENT_FAILURE]).unwrap();

    weather
        .publish(
            Envelope::new(messages::SKILL_FAILED)
                .with_data(json!({ "skill_id": "weather-skill", "reason": "crashed" })),
        )
        .unwrap();
    wait_for(&weather, |e| is_state(e, "weather-skill", "failed")).await;

    capture.publish(utterance("weather", "s2")).unwrap();
    wait_for(&observer, |e| e.msg_type == messages::INTENT_FAILURE).await;
    assert!(weather.try_recv().map_or(true, |e| e.msg_type != "weather-skill:current"));
}

#[tokio::test]
async fn silent_skill_times_out_and_is_failed() {
    let mut config = fast_config();
    config.dispatch.handler_timeout_secs = 1;
    let bus = start(config);
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let observer = bus
        .connect_local("observer", [messages::HANDLER_FAILED, messages::SKILL_STATE])
        .unwrap();

    capture.publish(utterance("weather", "s3")).unwrap();
    wait_for(&weather, |e| e.msg_type == "weather-skill:current").await;

    let failed = failure_and_state(&observer, "weather-skill").await;
    assert_eq!(failed.session_id(), Some("s3"));
    assert_eq!(failed.str_field("reason"), Some("timeout"));
}

#[tokio::test]
async fn disconnect_mid_turn_reports_failure() {
    let bus = start(fast_config());
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let observer = bus
        .connect_local("observer", [messages::HANDLER_FAILED, messages::SKILL_STATE])
        .unwrap();

    capture.publish(utterance("weather", "s4")).unwrap();
    wait_for(&weather, |e| e.msg_type == "weather-skill:current").await;
    drop(weather);

    let failed = failure_and_state(&observer, "weather-skill").await;
    assert_eq!(failed.str_field("reason"), Some("disconnected"));
}

#[tokio::test]
async fn reregistration_replaces_previous_intents() {
    let bus = start(fast_config());
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let diagnostics = bus
        .connect_local("diagnostics", [messages::REGISTRATION_REPLACED])
        .unwrap();

    weather
        .publish(Envelope::new(messages::REGISTER_INTENTS).with_data(json!({
            "skill_id": "weather-skill",
            "intents": [{ "name": "forecast", "vocabulary": ["forecast"] }],
        })))
        .unwrap();
    let replaced = wait_for(&diagnostics, |e| e.msg_type == messages::REGISTRATION_REPLACED).await;
    assert_eq!(replaced.data["previous"], json!(["current"]));

    capture.publish(utterance("forecast", "s5")).unwrap();
    wait_for(&weather, |e| e.msg_type == "weather-skill:forecast").await;
}

#[tokio::test]
async fn queries_answer_with_response_type() {
    let bus = start(fast_config());
    let _weather = skill(&bus, "weather-skill", weather_intents()).await;
    let asker = bus
        .connect_local(
            "gui",
            [
                format!("{}.response", messages::INTENT_GET),
                format!("{}.response", messages::SKILLS_GET),
            ],
        )
        .unwrap();

    asker
        .publish(Envelope::new(messages::INTENT_GET).with_data(json!({ "utterance": "weather" })))
        .unwrap();
    let intent = wait_for(&asker, |e| e.msg_type.starts_with(messages::INTENT_GET)).await;
    assert_eq!(intent.data["intent"]["skill_id"], "weather-skill");
    assert_eq!(intent.data["accepted"], true);

    asker.publish(Envelope::new(messages::SKILLS_GET)).unwrap();
    let skills = wait_for(&asker, |e| e.msg_type.starts_with(messages::SKILLS_GET)).await;
    assert_eq!(skills.data["skills"][0]["skill_id"], "weather-skill");
    assert_eq!(skills.data["skills"][0]["state"], "active");
}

#[tokio::test]
async fn second_fallback_handles_without_failure_event() {
    let bus = start(fast_config());
    let first = fallback_skill(&bus, "unknown-skill", 1).await;
    let second = fallback_skill(&bus, "wolfram-skill", 2).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();
    let observer = bus.connect_local("observer", [messages::INTENT_FAILURE]).unwrap();

    capture.publish(utterance("how tall is everest", "s6")).unwrap();

    let declined = wait_for(&first, |e| e.msg_type == messages::FALLBACK_REQUEST).await;
    first
        .publish(Envelope::new(messages::FALLBACK_RESPONSE).with_data(json!({
            "invocation_id": declined.str_field("invocation_id"),
            "handled": false,
        })))
        .unwrap();

    let accepted = wait_for(&second, |e| e.msg_type == messages::FALLBACK_REQUEST).await;
    assert_eq!(accepted.session_id(), Some("s6"));
    second
        .publish(Envelope::new(messages::FALLBACK_RESPONSE).with_data(json!({
            "invocation_id": accepted.str_field("invocation_id"),
            "handled": true,
        })))
        .unwrap();

    assert!(observer.recv_timeout(Duration::from_millis(300)).await.is_none());
    assert!(first.try_recv().map_or(true, |e| e.msg_type != messages::FALLBACK_REQUEST));
}

#[tokio::test]
async fn continuation_pin_is_per_session() {
    let bus = start(fast_config());
    let timer = skill(&bus, "timer-skill", timer_intents()).await;
    let weather = skill(&bus, "weather-skill", weather_intents()).await;
    let capture = bus.connect_local("capture", Vec::<String>::new()).unwrap();

    capture.publish(utterance("set a timer", "kitchen")).unwrap();
    let first = wait_for(&timer, |e| e.msg_type == "timer-skill:set").await;
    timer
        .publish(complete(&first, json!({ "expect_response": true })))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    capture.publish(utterance("weather", "bedroom")).unwrap();
    let other = wait_for(&weather, |e| e.msg_type == "weather-skill:current").await;
    assert_eq!(other.session_id(), Some("bedroom"));

    capture.publish(utterance("weather", "kitchen")).unwrap();
    let follow_up = wait_for(&timer, |e| e.msg_type == messages::CONVERSE_REQUEST).await;
    assert_eq!(follow_up.session_id(), Some("kitchen"));
}
