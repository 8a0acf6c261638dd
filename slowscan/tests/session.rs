//! Session lifecycle over synthesized recordings: listen, decode, persist,
//! and return to listening.

mod common;

use std::{
    sync::atomic::Ordering,
    time::Duration,
};

use common::{
    push_header,
    push_line,
    push_transmission,
    ToneGen,
    RATE,
};
use slowscan::{
    modes::ModeSpec,
    session::RunError,
    sink::MemorySink,
    source::{
        BufferSource,
        SampleSource,
    },
    ProgressEvent,
    Session,
    SessionConfig,
    SessionStatus,
    PORCH_TONE,
};
use tokio::sync::mpsc;

/// Header plus a full flat-gray Robot 36 transmission.
fn r36_recording() -> Vec<f32> {
    let mode = &ModeSpec::ROBOT_36;
    let mut synth = ToneGen::new(RATE);
    synth.silence(0.2);
    push_header(&mut synth, mode.vis_code);
    push_transmission(&mut synth, mode, |_line, channel| {
        vec![if channel == 0 { 160 } else { 128 }; mode.width]
    });
    synth.push(PORCH_TONE, 0.3);
    synth.finish()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn offline_recording_yields_a_stored_image() {
    let samples = r36_recording();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session::new(RATE, SessionConfig::default(), tx, MemorySink::new());

    let decoded = session.decode_buffer(&samples).expect("decode failed");
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].mode.name, "Robot 36");
    assert_eq!(decoded[0].image.dimensions(), (320, 240));
    assert!(decoded[0].byte_size() > 0);
    assert!(decoded[0].file_name().starts_with("r36_"));

    assert_eq!(session.images().len(), 1);
    assert_eq!(session.sink().images.len(), 1);
    assert_eq!(session.status(), SessionStatus::Listening);

    drop(session);
    let events = drain(&mut rx);
    assert_eq!(events[0].status, SessionStatus::Listening);
    assert!(
        events
            .iter()
            .any(|event| {
                event.status == SessionStatus::Decoding && event.mode == Some("Robot 36")
            })
    );
    assert!(
        events
            .iter()
            .any(|event| event.status == SessionStatus::Complete && event.percent == 100.0)
    );
    assert!(events.iter().all(|event| event.status != SessionStatus::Error));

    // previews arrive with the decode and their progress never goes back
    let percents: Vec<f32> = events
        .iter()
        .filter(|event| event.preview_png.is_some())
        .map(|event| event.percent)
        .collect();
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn trailing_partial_is_discarded_not_stored() {
    let mode = &ModeSpec::ROBOT_36;
    let mut synth = ToneGen::new(RATE);
    push_header(&mut synth, mode.vis_code);
    // a quarter of the image, then the carrier drops
    for _line in 0..60 {
        let rows = vec![vec![128u8; mode.width]; mode.channels.len()];
        push_line(&mut synth, mode, &rows);
    }
    let samples = synth.finish();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session::new(RATE, SessionConfig::default(), tx, MemorySink::new());
    let decoded = session.decode_buffer(&samples).expect("decode failed");

    assert!(decoded.is_empty());
    assert!(session.images().is_empty());
    assert!(session.sink().images.is_empty());
    assert_eq!(session.status(), SessionStatus::Listening);

    drop(session);
    let events = drain(&mut rx);
    assert!(events.iter().all(|event| event.status != SessionStatus::Complete));
    let discard = events
        .last()
        .expect("no events at all");
    assert_eq!(discard.status, SessionStatus::Listening);
    assert!(
        discard
            .message
            .as_deref()
            .is_some_and(|message| message.contains("discarded"))
    );
}

#[test]
fn cropped_recording_still_yields_the_image() {
    let mode = &ModeSpec::ROBOT_36;
    let mut synth = ToneGen::new(RATE);
    synth.silence(0.05);
    push_header(&mut synth, mode.vis_code);
    // the recording ends exactly at the last scanline, no trailing carrier
    push_transmission(&mut synth, mode, |_line, channel| {
        vec![if channel == 0 { 160 } else { 128 }; mode.width]
    });
    let samples = synth.finish();

    let mut session = Session::new(RATE, SessionConfig::default(), (), MemorySink::new());
    let decoded = session.decode_buffer(&samples).expect("decode failed");
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].mode.name, "Robot 36");
}

#[test]
fn consecutive_transmissions_both_decode() {
    let mode = &ModeSpec::ROBOT_36;
    let mut synth = ToneGen::new(RATE);
    synth.silence(0.1);
    for luma in [160u8, 60] {
        push_header(&mut synth, mode.vis_code);
        push_transmission(&mut synth, mode, |_line, channel| {
            vec![if channel == 0 { luma } else { 128 }; mode.width]
        });
        synth.push(PORCH_TONE, 0.3);
    }
    let samples = synth.finish();

    let mut session = Session::new(RATE, SessionConfig::default(), Vec::new(), MemorySink::new());
    let decoded = session.decode_buffer(&samples).expect("decode failed");
    assert_eq!(decoded.len(), 2);

    // the two images really are different transmissions
    let first = i32::from(decoded[0].image.get_pixel(160, 120).0[0]);
    let second = i32::from(decoded[1].image.get_pixel(160, 120).0[0]);
    assert!(first > second + 50, "luma {first} vs {second}");

    assert_eq!(session.sink().images.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_run_reports_source_end() {
    let samples = r36_recording();
    let mut source = BufferSource::new(samples, RATE);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session::new(RATE, SessionConfig::default(), tx, MemorySink::new());

    let result = session.run(&mut source).await;
    assert!(matches!(result, Err(RunError::SourceEnded)));
    // the image completed before the source ran dry
    assert_eq!(session.images().len(), 1);

    drop(session);
    let events = drain(&mut rx);
    let error = events
        .iter()
        .find(|event| event.status == SessionStatus::Error)
        .expect("no error event");
    assert!(error.message.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_flag_ends_a_live_run() {
    struct Silence;

    impl SampleSource for Silence {
        type Error = std::convert::Infallible;

        fn sample_rate(&self) -> f32 {
            RATE
        }

        async fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Self::Error> {
            tokio::task::yield_now().await;
            buffer.fill(0.0);
            Ok(buffer.len())
        }
    }

    let mut session = Session::new(RATE, SessionConfig::default(), (), MemorySink::new());
    let stop = session.stop_handle();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);
    });

    let mut source = Silence;
    let result = tokio::time::timeout(Duration::from_secs(10), session.run(&mut source)).await;
    assert!(matches!(result, Ok(Ok(()))));
    stopper.await.expect("stopper task panicked");
    assert!(session.images().is_empty());
}
