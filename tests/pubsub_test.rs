//! Publish/subscribe integration tests
//!
//! Every test runs a whole in-process network behind the `EventCloud`
//! facade and observes the solutions its subscription handles receive.

use std::collections::BTreeSet;
use std::time::Duration;

use eventcloud::api::{EventCloud, Solution};
use eventcloud::config::{DelayerSettings, EventCloudConfig, MatchingAlgorithm};
use eventcloud::core::{now_millis, CompoundEvent, Node, Quadruple};
use eventcloud::pubsub::{NotificationType, SubscriptionId};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// Small buffers and short flush intervals so timers fire during a test.
fn config() -> EventCloudConfig {
    let fast = DelayerSettings { buffer_size: 16, flush_interval_ms: 10 };
    EventCloudConfig {
        quadruples: fast,
        subscriptions: fast,
        compound_events: fast,
        ..EventCloudConfig::default()
    }
}

fn iri(local: &str) -> Node {
    Node::iri(format!("http://ex.org/{}", local))
}

fn quad(graph: &str, subject: &str, predicate: &str, object: &str) -> Quadruple {
    Quadruple::new(iri(graph), iri(subject), iri(predicate), iri(object))
}

/// Every solution received within `QUIET` after the network settled.
fn collect(cloud: &EventCloud, handle: &eventcloud::api::SubscriptionHandle) -> Vec<Solution> {
    assert!(cloud.flush());
    let mut solutions = Vec::new();
    while let Some(solution) = handle.receive_timeout(QUIET) {
        solutions.push(solution);
    }
    solutions
}

fn subscriptions_of(cloud: &EventCloud, original: SubscriptionId) -> usize {
    cloud
        .network()
        .activated_peers()
        .iter()
        .flat_map(|peer| peer.subscriptions())
        .filter(|subscription| subscription.original_id() == original)
        .count()
}

#[test]
fn test_graph_variable_binds_the_publishing_graph() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?g WHERE { GRAPH ?g { <http://ex.org/s> <http://ex.org/p> <http://ex.org/o> } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    cloud.publish(quad("g1", "s", "p", "o")).unwrap();
    assert!(cloud.flush());

    let solution = handle.receive_timeout(WAIT).expect("no solution");
    assert_eq!(solution.subscription_id, handle.id());
    assert_eq!(solution.binding().unwrap().get("g"), Some(&iri("g1")));
    assert!(handle.receive_timeout(QUIET).is_none());
}

#[test]
fn test_signal_carries_no_binding() {
    let cloud = EventCloud::new(config(), 3).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?o WHERE { GRAPH <http://ex.org/g> { <http://ex.org/s> <http://ex.org/p> ?o } }",
            NotificationType::Signal,
        )
        .unwrap();
    assert!(cloud.flush());

    cloud.publish(quad("g", "s", "p", "o1")).unwrap();
    cloud.publish(quad("g", "s", "other", "o2")).unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    assert!(solutions[0].binding().is_none());
    assert!(solutions[0].meta_graph.as_str().starts_with("http://ex.org/g"));
}

#[test]
fn test_rewrite_chain_yields_one_notification() {
    let cloud = EventCloud::new(config(), 6).unwrap();
    let handle = cloud
        .subscribe(
            "PREFIX ex: <http://ex.org/> \
             SELECT ?c WHERE { GRAPH ?g { ?a ex:p1 ?b . ?b ex:p2 ?c . ?c ex:p3 ?d } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    cloud.publish(quad("g", "a1", "p1", "b1")).unwrap();
    assert!(cloud.flush());
    cloud.publish(quad("g", "b1", "p2", "c1")).unwrap();
    assert!(cloud.flush());
    cloud.publish(quad("g", "c1", "p3", "d1")).unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].binding().unwrap().get("c"), Some(&iri("c1")));
}

#[test]
fn test_partial_bindings_are_merged() {
    let cloud = EventCloud::new(config(), 5).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?name ?age WHERE { GRAPH ?g { ?p <http://ex.org/name> ?name . ?p <http://ex.org/age> ?age } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    cloud
        .publish(Quadruple::new(iri("people"), iri("alice"), iri("name"), Node::literal("Alice")))
        .unwrap();
    assert!(cloud.flush());
    cloud
        .publish(Quadruple::new(iri("people"), iri("alice"), iri("age"), Node::literal("30")))
        .unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    let binding = solutions[0].binding().unwrap();
    assert_eq!(binding.get("name"), Some(&Node::literal("Alice")));
    assert_eq!(binding.get("age"), Some(&Node::literal("30")));
    assert_eq!(binding.len(), 2);
    assert_eq!(cloud.proxy().pending_parts(), 0);
}

#[test]
fn test_facts_older_than_the_subscription_are_ignored() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?o WHERE { GRAPH ?g { <http://ex.org/s> <http://ex.org/p> ?o } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    let old = quad("g", "s", "p", "old").with_publication_time(now_millis() - 60_000);
    cloud.publish(old).unwrap();
    assert!(collect(&cloud, &handle).is_empty());

    cloud.publish(quad("g", "s", "p", "new")).unwrap();
    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].binding().unwrap().get("o"), Some(&iri("new")));
}

#[test]
fn test_stored_facts_match_later_subscriptions() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?x ?y WHERE { GRAPH ?g { ?x <http://ex.org/knows> ?y . ?y <http://ex.org/likes> <http://ex.org/tea> } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    // The second fact is stored before the derived subscription exists.
    cloud.publish(quad("g", "bob", "likes", "tea")).unwrap();
    assert!(cloud.flush());
    cloud.publish(quad("g", "ann", "knows", "bob")).unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    let binding = solutions[0].binding().unwrap();
    assert_eq!(binding.get("x"), Some(&iri("ann")));
    assert_eq!(binding.get("y"), Some(&iri("bob")));
}

#[test]
fn test_derived_subscription_keeps_the_indexation_time() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?x WHERE { GRAPH ?g { ?x <http://ex.org/knows> ?y . ?y <http://ex.org/likes> <http://ex.org/tea> } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());
    let indexed_at = cloud
        .network()
        .activated_peers()
        .iter()
        .flat_map(|peer| peer.subscriptions())
        .find(|subscription| subscription.original_id() == handle.id())
        .and_then(|subscription| subscription.indexation_time())
        .unwrap();

    cloud.publish(quad("g", "ann", "knows", "bob")).unwrap();
    assert!(cloud.flush());
    let derived: Vec<_> = cloud
        .network()
        .activated_peers()
        .iter()
        .flat_map(|peer| peer.subscriptions())
        .filter(|subscription| subscription.original_id() == handle.id() && subscription.parent_id().is_some())
        .collect();
    assert!(!derived.is_empty());
    assert!(derived.iter().all(|subscription| subscription.indexation_time() == Some(indexed_at)));

    let late = quad("g", "bob", "likes", "tea").with_publication_time(indexed_at - 1);
    cloud.publish(late).unwrap();
    assert!(collect(&cloud, &handle).is_empty());

    let on_time = quad("g", "bob", "likes", "tea").with_publication_time(indexed_at);
    cloud.publish(on_time).unwrap();
    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].binding().unwrap().get("x"), Some(&iri("ann")));
}

/// Solutions of one scenario, published without waiting between steps.
fn unsettled_scenario(config: EventCloudConfig) -> BTreeSet<String> {
    let cloud = EventCloud::new(config, 5).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?x ?y WHERE { GRAPH ?g { ?x <http://ex.org/follows> ?y . ?y <http://ex.org/posts> ?z } }",
            NotificationType::Binding,
        )
        .unwrap();
    cloud.publish(quad("g", "u1", "follows", "u2")).unwrap();
    cloud.publish(quad("g", "u2", "posts", "m1")).unwrap();
    cloud.publish(quad("g", "u3", "follows", "u4")).unwrap();
    cloud.publish(quad("g", "u5", "posts", "m2")).unwrap();
    cloud.publish(quad("g", "u4", "posts", "m3")).unwrap();

    let solutions = collect(&cloud, &handle);
    solutions
        .iter()
        .map(|solution| {
            let binding = solution.binding().unwrap();
            format!("{}->{}", binding.get("x").unwrap().as_str(), binding.get("y").unwrap().as_str())
        })
        .collect()
}

#[test]
fn test_batching_does_not_change_solutions() {
    let immediate = DelayerSettings { buffer_size: 1, flush_interval_ms: 1 };
    let unbuffered = EventCloudConfig {
        quadruples: immediate,
        subscriptions: immediate,
        compound_events: immediate,
        ..EventCloudConfig::default()
    };
    let batched_settings = DelayerSettings { buffer_size: 10_000, flush_interval_ms: 60_000 };
    let batched = EventCloudConfig {
        quadruples: batched_settings,
        subscriptions: batched_settings,
        compound_events: batched_settings,
        ..EventCloudConfig::default()
    };

    let expected: BTreeSet<String> = ["http://ex.org/u1->http://ex.org/u2", "http://ex.org/u3->http://ex.org/u4"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(unsettled_scenario(unbuffered), expected);
    assert_eq!(unsettled_scenario(batched), expected);
}

#[test]
fn test_unsubscribe_removes_derived_subscriptions() {
    let cloud = EventCloud::new(config(), 5).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?y WHERE { GRAPH ?g { ?x <http://ex.org/p1> ?y . ?y <http://ex.org/p2> ?z } }",
            NotificationType::Binding,
        )
        .unwrap();
    let id = handle.id();
    assert!(cloud.flush());
    cloud.publish(quad("g", "a", "p1", "b")).unwrap();
    assert!(cloud.flush());

    let before = subscriptions_of(&cloud, id);
    assert!(before >= 2, "expected the original and a derived subscription, got {}", before);

    let removed = cloud.unsubscribe(id).unwrap();
    assert!(cloud.flush());
    assert!(removed >= before, "removed {} of {}", removed, before);
    assert_eq!(subscriptions_of(&cloud, id), 0);

    cloud.publish(quad("g", "b", "p2", "c")).unwrap();
    assert!(cloud.flush());
    assert!(handle.try_receive().is_none());
    assert!(matches!(cloud.unsubscribe(id), Err(eventcloud::Error::SubscriptionNotFound(_))));
}

#[test]
fn test_unreachable_subscriber_is_dropped_after_failures() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let max_failures = cloud.network().config().subscriber_max_failures;
    let handle = cloud
        .subscribe(
            "SELECT ?o WHERE { GRAPH ?g { <http://ex.org/s> <http://ex.org/p> ?o } }",
            NotificationType::Signal,
        )
        .unwrap();
    let id = handle.id();
    assert!(cloud.flush());
    drop(handle);

    for round in 1..=max_failures {
        // Same fact, fresh publication time: always the same peer delivers.
        cloud.publish(quad("g", "s", "p", "o")).unwrap();
        assert!(cloud.flush());
        if round < max_failures {
            assert!(subscriptions_of(&cloud, id) > 0, "dropped after {} failures", round);
        }
    }

    assert_eq!(subscriptions_of(&cloud, id), 0);
}

#[test]
fn test_compound_event_matches_as_a_unit() {
    let config = EventCloudConfig { matching_algorithm: MatchingAlgorithm::CompoundEvent, ..config() };
    let cloud = EventCloud::new(config, 5).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?v ?u WHERE { GRAPH ?g { ?s <http://ex.org/value> ?v . ?s <http://ex.org/unit> ?u } }",
            NotificationType::Binding,
        )
        .unwrap();
    assert!(cloud.flush());

    let event = CompoundEvent::new(vec![
        Quadruple::new(iri("e1"), iri("sensor"), iri("value"), Node::literal("21")),
        Quadruple::new(iri("e1"), iri("sensor"), iri("unit"), Node::literal("C")),
    ])
    .unwrap();
    cloud.publish_compound_event(event).unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    let binding = solutions[0].binding().unwrap();
    assert_eq!(binding.get("v"), Some(&Node::literal("21")));
    assert_eq!(binding.get("u"), Some(&Node::literal("C")));
}

#[test]
fn test_compound_event_subscription_receives_every_quadruple() {
    let cloud = EventCloud::new(config(), 4).unwrap();
    let handle = cloud
        .subscribe(
            "SELECT ?v WHERE { GRAPH ?g { ?s <http://ex.org/value> ?v } }",
            NotificationType::CompoundEvent,
        )
        .unwrap();
    assert!(cloud.flush());

    cloud.publish(Quadruple::new(iri("e2"), iri("sensor"), iri("value"), Node::literal("7"))).unwrap();

    let solutions = collect(&cloud, &handle);
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].quadruples().len(), 1);
    assert_eq!(solutions[0].quadruples()[0].object(), &Node::literal("7"));
}
