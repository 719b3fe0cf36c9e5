use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use caravel_core::auth::TrustPolicy;
use caravel_core::error::Error;
use caravel_core::oci::RegistryClient;
use caravel_core::settings::Settings;

/// A registry that serves one scripted response per connection and counts
/// how many requests it saw.
fn canned_registry(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    thread::spawn(move || {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);

            let reason = match status {
                200 => "OK",
                401 => "Unauthorized",
                404 => "Not Found",
                _ => "Internal Server Error",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (format!("http://{addr}"), hits)
}

fn settings(retry_attempts: u32) -> Settings {
    Settings {
        retry_attempts,
        timeout_secs: 10,
        ..Settings::default()
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let (url, hits) = canned_registry(vec![(500, ""), (500, ""), (200, "{}")]);
    let client =
        RegistryClient::new(&url, None, &TrustPolicy::default(), &settings(3)).unwrap();

    client.login().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_as_network_error() {
    let (url, hits) = canned_registry(vec![(500, ""), (500, "")]);
    let client =
        RegistryClient::new(&url, None, &TrustPolicy::default(), &settings(2)).unwrap();

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, Error::Network { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let (url, hits) = canned_registry(vec![(401, "")]);
    let client =
        RegistryClient::new(&url, None, &TrustPolicy::default(), &settings(3)).unwrap();

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn other_client_errors_are_terminal() {
    let (url, hits) = canned_registry(vec![(404, "")]);
    let client =
        RegistryClient::new(&url, None, &TrustPolicy::default(), &settings(3)).unwrap();

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, Error::Network { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
