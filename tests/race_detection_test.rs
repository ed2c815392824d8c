// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for fladmin
//!
//! These tests drive the session manager, the command registry and the
//! server from many tasks at once. They are designed to detect data races
//! when run with ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Session management thread safety
//! - Server concurrent request handling
//! - Registry replacement under load

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use fladmin::commands::new_registry_with_builtins;
use fladmin::security::{SessionConfig, SessionManager};
use fladmin::server::ServerOptions;

use common::{plain_options, send, start_server};

// Test configuration
const CONCURRENCY_LEVEL: usize = 32;
const ITERATIONS_PER_TASK: usize = 25;
const TEST_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// SESSION MANAGER TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_concurrent_access() {
    let sessions = Arc::new(SessionManager::new(SessionConfig {
        idle_timeout: Duration::from_secs(3600),
        monitor_interval: Duration::from_millis(10),
    }));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let sessions = Arc::clone(&sessions);
        handles.push(tokio::task::spawn_blocking(move || {
            let mut kept = Vec::new();
            for j in 0..ITERATIONS_PER_TASK {
                let session = sessions.create_session(format!("user{}", i));
                assert!(sessions.mark_active(&session.token));
                assert!(sessions.get_session(&session.token).is_some());
                if j % 2 == 0 {
                    assert!(sessions.end_session(&session.token).is_some());
                    assert!(sessions.end_session(&session.token).is_none());
                } else {
                    kept.push(session.token);
                }
            }
            kept
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.extend(handle.await.expect("Task panicked"));
        }
        tokens
    })
    .await;
    let tokens = result.expect("Test timed out");

    let unique: HashSet<&String> = tokens.iter().collect();
    assert_eq!(unique.len(), tokens.len(), "session tokens must be unique");
    assert_eq!(sessions.get_sessions().len(), tokens.len());

    sessions.shutdown();
}

// =============================================================================
// SERVER CONCURRENCY TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_concurrent_clients() {
    let options = ServerOptions {
        max_connections: CONCURRENCY_LEVEL * 2,
        ..plain_options()
    };
    let server = start_server(options, Arc::new(new_registry_with_builtins().unwrap())).await;
    let addr = server.local_addr();
    let served = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let served = Arc::clone(&served);
        handles.push(tokio::spawn(async move {
            for j in 0..4 {
                let word = format!("c{}r{}", i, j);
                let reply = send(addr, &format!("echo {}", word), None).await;
                assert!(reply.errors().is_empty(), "errors: {:?}", reply.errors());
                assert_eq!(reply.lines(), vec!["echo", word.as_str()]);
                served.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
    assert_eq!(served.load(Ordering::Relaxed), (CONCURRENCY_LEVEL * 4) as u64);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_swap_under_load() {
    let registry = Arc::new(new_registry_with_builtins().unwrap());
    let server = Arc::new(start_server(plain_options(), registry).await);
    let addr = server.local_addr();
    let mut handles = vec![];

    for _ in 0..8 {
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                let reply = send(addr, "echo swap", None).await;
                assert_eq!(reply.lines(), vec!["echo", "swap"]);
            }
        }));
    }

    let swapper = Arc::clone(&server);
    let swaps = tokio::task::spawn_blocking(move || {
        for _ in 0..10 {
            let registry = Arc::new(new_registry_with_builtins().unwrap());
            swapper.set_command_registry(registry).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
        swaps.await.expect("Swapper panicked");
    })
    .await;
    assert!(result.is_ok(), "Test timed out");

    server.stop().await;
}
