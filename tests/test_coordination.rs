/*
 * Whisper Bridge - Rust Edition
 * Copyright (c) 2025 Whisper Bridge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! End-to-end coordination: a real producer and a real consumer task set
//! over one shared rendezvous directory, with a scripted engine in place
//! of the model.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use whisper_bridge_rs::audio::silence_block;
use whisper_bridge_rs::config::Config;
use whisper_bridge_rs::consumer::Consumer;
use whisper_bridge_rs::inference::ScriptedEngine;
use whisper_bridge_rs::messages::{
    self, chunk_meta_name, chunk_pcm_name, ChunkMetadata, ControlSignal, StatusRecord,
    CHANNELS, CONTROL_FILE, SAMPLE_RATE, STATUS_FILE,
};
use whisper_bridge_rs::producer::ProducerSession;
use whisper_bridge_rs::rendezvous::{RendezvousStore, Subdir};
use whisper_bridge_rs::types::{AudioFormat, ControlKind, ProducerEvent};
use whisper_bridge_rs::{reaper, sequencer};

struct Bridge {
    _dir: TempDir,
    store: RendezvousStore,
    config: Config,
    cancel: CancellationToken,
    _consumer: Consumer,
    engine_log: Arc<parking_lot::Mutex<Vec<usize>>>,
}

/// Spin up a full consumer over a fresh rendezvous. The warm-up pass
/// consumes the first scripted word and the first engine-log entry.
async fn bridge(script: &[&str]) -> Bridge {
    let dir = TempDir::new().unwrap();
    let mut config = Config::rooted_at(dir.path().join("bridge"));
    config.transcription_timeout = Duration::from_secs(5);

    let store = RendezvousStore::open(&config.bridge_dir).unwrap();
    let engine = ScriptedEngine::new(script.to_vec());
    let engine_log = engine.call_log();
    let cancel = CancellationToken::new();
    let consumer = Consumer::start(&config, store.clone(), Box::new(engine), cancel.clone())
        .await
        .unwrap();

    Bridge {
        _dir: dir,
        store,
        config,
        cancel,
        _consumer: consumer,
        engine_log,
    }
}

fn producer(b: &Bridge) -> (ProducerSession, mpsc::UnboundedReceiver<ProducerEvent>) {
    ProducerSession::new(b.store.clone(), &b.config)
}

/// Hand-write a chunk pair, bypassing the producer, to control arrival
/// order and session identity.
fn write_raw_chunk(store: &RendezvousStore, session: &str, id: u64, is_last: bool) {
    let pcm_name = chunk_pcm_name(session, id);
    // 0.2 s of silence.
    store
        .write_atomic(Subdir::Audio, &pcm_name, &vec![0u8; 6400])
        .unwrap();
    let meta = ChunkMetadata {
        session_id: session.to_string(),
        chunk_id: id,
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
        format: AudioFormat::Pcm16,
        duration_secs: 0.2,
        timestamp: Utc::now(),
        is_last_chunk: is_last,
        pcm_filename: pcm_name,
    };
    store
        .write_atomic(
            Subdir::Audio,
            &chunk_meta_name(session, id),
            &messages::encode(&meta).unwrap(),
        )
        .unwrap();
}

async fn expect_final(events: &mut mpsc::UnboundedReceiver<ProducerEvent>) -> String {
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for final transcript")
            .expect("event channel closed");
        match event {
            ProducerEvent::Final { text, .. } => return text,
            ProducerEvent::Partial { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_single_chunk() {
    let b = bridge(&["warmup", "hello world"]).await;
    let (mut session, mut events) = producer(&b);

    session.begin().await.unwrap();
    // One 0.8 s chunk: 25600 bytes of pcm16.
    session
        .submit_chunk(&silence_block(0.8), true)
        .await
        .unwrap();
    session.end().await.unwrap();

    let text = expect_final(&mut events).await;
    assert_eq!(text, "hello world");

    // Consumed chunks leave nothing in audio/.
    sleep(Duration::from_millis(200)).await;
    assert!(b.store.list(Subdir::Audio).unwrap().is_empty());
    // Warm-up plus exactly one real chunk of 12800 samples.
    assert_eq!(*b.engine_log.lock(), vec![16_000, 12_800]);

    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_arrival_is_replayed_in_order() {
    let b = bridge(&["warmup", "a", "b", "c", "d"]).await;
    let (mut session, mut events) = producer(&b);

    let sid = session.begin().await.unwrap();
    // Metadata files land in mtime order 0, 2, 1, 3.
    for id in [0u64, 2, 1, 3] {
        write_raw_chunk(&b.store, &sid, id, id == 3);
        sleep(Duration::from_millis(30)).await;
    }

    // The orchestrator saw them as 0, 1, 2, 3 or the text would differ.
    let text = expect_final(&mut events).await;
    assert_eq!(text, "a b c d");
    // Warm-up plus four chunks reached the model.
    assert_eq!(b.engine_log.lock().len(), 5);

    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn overflow_drops_oldest_and_is_observable() {
    let b = bridge(&["warmup"]).await;
    let (mut session, _events) = producer(&b);

    let sid = session.begin().await.unwrap();
    write_raw_chunk(&b.store, &sid, 0, false);
    sleep(Duration::from_millis(200)).await;

    // Chunks 1..=10 never arrive; 11..=21 exceed the reorder buffer.
    for id in 11..=21 {
        write_raw_chunk(&b.store, &sid, id, false);
    }
    sleep(Duration::from_millis(300)).await;

    // The drop is surfaced through the status record.
    let signal = ControlSignal::new(ControlKind::Ping, &sid);
    b.store
        .write_atomic(Subdir::Control, CONTROL_FILE, &messages::encode(&signal).unwrap())
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    let status: StatusRecord =
        messages::decode(&b.store.read(Subdir::Control, STATUS_FILE).unwrap()).unwrap();
    assert_eq!(status.dropped_chunks, 1);

    // Chunk 0 was consumed, 11 evicted; 12..=21 stay buffered, which
    // bounds audio/ to capacity pairs.
    let audio_files = b.store.list(Subdir::Audio).unwrap();
    assert_eq!(audio_files.len(), sequencer::SEQUENCER_CAPACITY * 2);
    assert!(!b
        .store
        .exists(Subdir::Audio, &chunk_meta_name(&sid, 11))
        .unwrap());

    // Only warm-up and chunk 0 reached the model.
    assert_eq!(b.engine_log.lock().len(), 2);

    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_suppresses_partials_and_finals() {
    let b = bridge(&["warmup", "ghost"]).await;
    let (mut session, mut events) = producer(&b);

    session.begin().await.unwrap();
    session
        .submit_chunk(&silence_block(0.2), true)
        .await
        .unwrap();
    session.abort().await.unwrap();

    // Whatever the consumer managed to do with the chunk, none of it
    // reaches the producer after the cancel.
    sleep(Duration::from_millis(800)).await;
    assert!(events.try_recv().is_err());

    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_session_debris_is_deleted_not_transcribed() {
    let b = bridge(&["warmup", "fresh"]).await;
    let (mut session, mut events) = producer(&b);

    session.begin().await.unwrap();
    sleep(Duration::from_millis(150)).await;
    session.abort().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    let s6 = session.begin().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    // Debris from the aborted era, named for a dead session.
    write_raw_chunk(&b.store, "dead-session", 0, false);
    sleep(Duration::from_millis(300)).await;

    // Deleted without being fed to the model.
    let leftovers = b.store.list(Subdir::Audio).unwrap();
    assert!(leftovers.iter().all(|(n, _)| !n.contains("dead-session")));
    assert_eq!(b.engine_log.lock().len(), 1, "only warm-up ran");

    // The live session still works end to end.
    session
        .submit_chunk(&silence_block(0.2), true)
        .await
        .unwrap();
    session.end().await.unwrap();
    let text = expect_final(&mut events).await;
    assert_eq!(text, "fresh");
    assert!(s6.len() > 0);

    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_without_consumer_then_reaper_cleanup() {
    // No consumer at all on this rendezvous.
    let dir = TempDir::new().unwrap();
    let mut config = Config::rooted_at(dir.path().join("bridge"));
    config.transcription_timeout = Duration::from_millis(400);
    config.producer_poll_interval = Duration::from_millis(25);
    let store = RendezvousStore::open(&config.bridge_dir).unwrap();

    let (mut session, mut events) = ProducerSession::new(store.clone(), &config);
    session.begin().await.unwrap();
    session
        .submit_chunk(&silence_block(0.2), true)
        .await
        .unwrap();
    session.end().await.unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for the timeout event")
        .expect("event channel closed");
    assert!(matches!(event, ProducerEvent::TimedOut));

    // The chunk files are still lying around; a consumer restart sweeps
    // anything past the age bound.
    assert!(!store.list(Subdir::Audio).unwrap().is_empty());
    sleep(Duration::from_millis(50)).await;
    let removed = reaper::startup_sweep_with_age(&store, Duration::from_millis(10)).unwrap();
    assert!(removed >= 2);
    assert!(store.list(Subdir::Audio).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rereading_an_unchanged_final_delivers_once() {
    let b = bridge(&["warmup", "once"]).await;
    let (mut session, mut events) = producer(&b);

    session.begin().await.unwrap();
    session
        .submit_chunk(&silence_block(0.2), true)
        .await
        .unwrap();
    session.end().await.unwrap();

    let text = expect_final(&mut events).await;
    assert_eq!(text, "once");

    // The final file stays in place, but no duplicate delivery happens.
    sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_err());
    assert!(b
        .store
        .exists(Subdir::Transcripts, messages::FINAL_FILE)
        .unwrap());

    b.cancel.cancel();
}
