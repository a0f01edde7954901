//! Voice pipeline integration tests
//!
//! Exercises the transcription stream against a local WebSocket server
//! standing in for the vendor; no audio hardware needed.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

use audiosmith::Error;
use audiosmith::retry::RetryPolicy;
use audiosmith::voice::{
    SAMPLE_RATE, StaticSource, SttConfig, TranscriptEvent, TranscriptEvents, TranscriptStream,
    WavFileSource,
};

const SPEECH_STARTED: &str = r#"{"type":"SpeechStarted","timestamp":0.1}"#;
const INTERIM: &str = r#"{"type":"Results","is_final":false,
    "channel":{"alternatives":[{"transcript":"Hel","confidence":0.6}]}}"#;
const FINAL: &str = r#"{"type":"Results","is_final":true,
    "channel":{"alternatives":[{"transcript":"Hello","confidence":0.97,"languages":["en"]}]}}"#;

/// What the fake vendor saw on one connection
#[derive(Debug)]
enum Seen {
    Audio(Vec<u8>),
    Text(String),
    Closed,
}

fn config(addr: SocketAddr) -> SttConfig {
    SttConfig {
        url: format!("ws://{addr}/v1/listen"),
        retry: RetryPolicy::linear(2, Duration::from_millis(20)),
        connect_timeout: Duration::from_secs(2),
        ..SttConfig::new("secret")
    }
}

/// Accept connections, send `script` on each, and report what arrives
async fn fake_vendor(
    script: Vec<&'static str>,
) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen_requests = requests.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let requests = seen_requests.clone();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                requests
                    .lock()
                    .unwrap()
                    .push(format!("{} {auth}", req.uri()));
                Ok(resp)
            };
            let Ok(mut socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };

            for frame in &script {
                socket.send(Message::Text((*frame).to_string())).await.unwrap();
            }

            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = socket.next().await {
                    let seen = match message {
                        Message::Binary(bytes) => Seen::Audio(bytes),
                        Message::Text(text) => {
                            let closing = text.contains("CloseStream");
                            let _ = tx.send(Seen::Text(text));
                            if closing {
                                let _ = socket.close(None).await;
                                break;
                            }
                            continue;
                        }
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    let _ = tx.send(seen);
                }
                let _ = tx.send(Seen::Closed);
            });
        }
    });

    (addr, rx, requests)
}

async fn next_event(events: &mut TranscriptEvents) -> audiosmith::Result<TranscriptEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for a transcript event")
        .expect("event stream ended")
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for the server")
        .expect("server gone")
}

#[tokio::test]
async fn test_stream_delivers_events_and_audio() {
    let (addr, mut seen, requests) = fake_vendor(vec![SPEECH_STARTED, INTERIM, FINAL]).await;

    let source = StaticSource::new(vec![vec![1, 2], vec![3, 4]]);
    let stopped = source.stopped_flag();
    let mut stream = TranscriptStream::open(config(addr), Some(Box::new(source)))
        .await
        .unwrap();
    let mut events = stream.take_events().unwrap();
    assert!(stream.take_events().is_none());

    assert!(next_event(&mut events).await.unwrap().speech_started);
    let interim = next_event(&mut events).await.unwrap();
    assert_eq!(interim.content, "Hel");
    assert!(!interim.is_final);
    let last = next_event(&mut events).await.unwrap();
    assert_eq!(last.content, "Hello");
    assert!(last.is_final);
    assert_eq!(last.language, "en");

    assert!(matches!(next_seen(&mut seen).await, Seen::Audio(b) if b == vec![1, 2]));
    assert!(matches!(next_seen(&mut seen).await, Seen::Audio(b) if b == vec![3, 4]));

    // Chunks pushed by hand follow the source's
    stream.send(vec![5, 6]).unwrap();
    assert!(matches!(next_seen(&mut seen).await, Seen::Audio(b) if b == vec![5, 6]));

    stream.close().await;
    stream.close().await;
    assert!(matches!(next_seen(&mut seen).await, Seen::Text(t) if t.contains("CloseStream")));
    assert!(stopped.load(Ordering::SeqCst));
    assert!(stream.send(vec![7]).is_err());

    let request = requests.lock().unwrap()[0].clone();
    assert!(request.contains("encoding=linear16"));
    assert!(request.contains(&format!("sample_rate={SAMPLE_RATE}")));
    assert!(request.ends_with("Token secret"));
}

#[tokio::test]
async fn test_unreachable_vendor_releases_source() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = StaticSource::new(vec![vec![0; 320]]);
    let stopped = source.stopped_flag();

    let result = TranscriptStream::open(config(addr), Some(Box::new(source))).await;

    assert!(matches!(result, Err(Error::StreamUnavailable(_))));
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            *counter.lock().unwrap() += 1;
            let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        }
    });

    let result = TranscriptStream::open(config(addr), None).await;

    match result {
        Err(Error::StreamUnavailable(reason)) => assert!(reason.contains("credentials")),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connected with rejected credentials"),
    }
    assert_eq!(*attempts.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // First connection dies right after the handshake
        let (stream, _) = listener.accept().await.unwrap();
        let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(socket);

        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        socket.send(Message::Text(FINAL.to_string())).await.unwrap();
        while let Some(Ok(_)) = socket.next().await {}
    });

    let mut stream = TranscriptStream::open(config(addr), None).await.unwrap();
    let mut events = stream.take_events().unwrap();

    assert!(matches!(next_event(&mut events).await, Err(Error::Stream(_))));
    assert_eq!(next_event(&mut events).await.unwrap().content, "Hello");

    stream.close().await;
}

#[tokio::test]
async fn test_wav_file_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..(SAMPLE_RATE / 4) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        writer.write_sample((i % 100) as i16).unwrap();
    }
    writer.finalize().unwrap();

    let (addr, mut seen, _) = fake_vendor(vec![FINAL]).await;
    let source = WavFileSource::open(&path).unwrap();
    let mut stream = TranscriptStream::open(config(addr), Some(Box::new(source)))
        .await
        .unwrap();
    let mut events = stream.take_events().unwrap();

    assert_eq!(next_event(&mut events).await.unwrap().content, "Hello");

    let mut audio_bytes = 0;
    loop {
        match next_seen(&mut seen).await {
            Seen::Audio(bytes) => audio_bytes += bytes.len(),
            Seen::Text(text) if text.contains("CloseStream") => break,
            Seen::Text(_) => {}
            Seen::Closed => panic!("closed before CloseStream"),
        }
    }
    assert_eq!(audio_bytes, (SAMPLE_RATE / 4) as usize * 2);

    // The vendor closes after flushing; the event stream then ends
    let end = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap();
    assert!(end.is_none());
    stream.close().await;
}
