//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use ponghub::monitors::probe::{Prober, RetryPolicy};
use ponghub::security::{SharedEnv, StaticEnv};

/// Serve `app` on an ephemeral localhost port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A localhost port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn env(values: &[(&str, &str)]) -> SharedEnv {
    let env = values
        .iter()
        .fold(StaticEnv::new(), |env, (k, v)| env.with(*k, *v));
    Arc::new(env)
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

pub fn prober(env: SharedEnv) -> Prober {
    Prober::new(fast_policy(), env).unwrap()
}
