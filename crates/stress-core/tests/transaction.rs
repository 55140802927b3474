mod common;

use common::TestServer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stress_core::{RequestHandle, ResponseHandle, Share, StepConfig, Task, TaskConfig};

fn quiet(config: TaskConfig) -> Task {
    let config = TaskConfig {
        handle_interrupt: false,
        ..config
    };
    Task::new(config).with_output(std::io::sink())
}

#[test]
fn test_response_body_forwarded_to_next_step() {
    let server = TestServer::start();
    let task = quiet(TaskConfig::iterations(10, 2));

    let login = StepConfig::new(server.url("/token")).after_response(
        |res: &ResponseHandle, share: &mut Share| {
            share.insert("token", res.body().clone());
        },
    );
    let echo = StepConfig::new(server.url("/echo"))
        .method("POST")
        .before_request(|req: &mut RequestHandle, share: &mut Share| {
            if let Some(token) = share.get("token").and_then(|v| v.as_bytes()) {
                req.set_body(token.to_vec());
            }
        });

    let outcome = task.run_transaction(vec![login, echo]).unwrap();
    assert_eq!(outcome.results.len(), 10);
    for result in &outcome.results {
        assert_eq!(result.details.len(), 2);
        assert!(result.details[0].url.ends_with("/token"));
        assert!(result.details[1].url.ends_with("/echo"));
        assert_eq!(result.details[1].method, "POST");
    }

    let echoed: Vec<_> = server
        .seen()
        .into_iter()
        .filter(|s| s.path == "/echo")
        .collect();
    assert_eq!(echoed.len(), 10);
    assert!(echoed.iter().all(|s| s.body.as_ref() == b"hello"));
}

#[test]
fn test_share_is_fresh_per_iteration() {
    let server = TestServer::start();
    let task = quiet(TaskConfig::iterations(20, 4));
    let leaks = Arc::new(AtomicUsize::new(0));
    let mismatches = Arc::new(AtomicUsize::new(0));
    let seen_ids = Arc::new(Mutex::new(HashSet::new()));

    let first = {
        let leaks = leaks.clone();
        StepConfig::new(server.url("/")).before_request(
            move |req: &mut RequestHandle, share: &mut Share| {
                if !share.is_empty() {
                    leaks.fetch_add(1, Ordering::SeqCst);
                }
                let id = format!("{}:{}", req.worker(), req.iteration());
                share.insert("iteration", id);
            },
        )
    };
    let second = {
        let mismatches = mismatches.clone();
        let seen_ids = seen_ids.clone();
        StepConfig::new(server.url("/")).before_request(
            move |req: &mut RequestHandle, share: &mut Share| {
                let expected = format!("{}:{}", req.worker(), req.iteration());
                if share.get("iteration").and_then(|v| v.as_str()) != Some(expected.as_str()) {
                    mismatches.fetch_add(1, Ordering::SeqCst);
                }
                seen_ids.lock().insert(expected);
            },
        )
    };

    task.run_transaction(vec![first, second]).unwrap();
    assert_eq!(leaks.load(Ordering::SeqCst), 0);
    assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    assert_eq!(seen_ids.lock().len(), 20);
}

#[test]
fn test_failed_step_does_not_abort_the_rest() {
    let server = TestServer::start();
    let task = quiet(TaskConfig::iterations(3, 1));
    let broken = StepConfig::new(common::closed_port_url());
    let healthy = StepConfig::new(server.url("/"));

    let outcome = task.run_transaction(vec![broken, healthy]).unwrap();
    for result in &outcome.results {
        assert!(result.has_errors());
        assert!(result.details[0].error.is_some());
        assert_eq!(result.details[1].status, 200);
    }
    assert_eq!(server.hits("/"), 3);
}
