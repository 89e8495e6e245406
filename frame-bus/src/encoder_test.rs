use std::{
    io,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use super::{EncoderError, EncoderLauncher, EncoderProcess, EncoderSink, FeedError};
use crate::{
    frame::{Frame, Geometry, PixelLayout, SourceKind, StreamInfo},
    output::{Destination, PushOutput, SegmentedOutput},
};

#[derive(Default)]
struct Journal {
    written: Vec<u64>,
    shutdowns: usize,
}

/// Accepts `accept` frames, then behaves like a process whose pipe broke.
struct FakeProcess {
    journal: Arc<Mutex<Journal>>,
    accept: usize,
    exited: bool,
}

#[async_trait]
impl EncoderProcess for FakeProcess {
    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut journal = self.journal.lock().unwrap();
        if journal.written.len() >= self.accept {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        journal.written.push(frame.seq());
        Ok(())
    }

    fn exit_status(&mut self) -> Option<String> {
        self.exited.then(|| "exit status: 1".to_string())
    }

    async fn shutdown(&mut self, _grace: Duration) -> anyhow::Result<()> {
        self.journal.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

struct FakeLauncher {
    journal: Arc<Mutex<Journal>>,
    accept: usize,
    exited: bool,
}

impl FakeLauncher {
    fn new(accept: usize) -> Self {
        Self {
            journal: Arc::default(),
            accept,
            exited: false,
        }
    }
}

impl EncoderLauncher for FakeLauncher {
    fn launch(
        &self,
        _info: &StreamInfo,
        _destination: &Destination,
    ) -> anyhow::Result<Box<dyn EncoderProcess>> {
        Ok(Box::new(FakeProcess {
            journal: Arc::clone(&self.journal),
            accept: self.accept,
            exited: self.exited,
        }))
    }
}

struct FailingLauncher;

impl EncoderLauncher for FailingLauncher {
    fn launch(
        &self,
        _info: &StreamInfo,
        _destination: &Destination,
    ) -> anyhow::Result<Box<dyn EncoderProcess>> {
        Err(anyhow::anyhow!("no such program"))
    }
}

fn geometry(width: u32, height: u32) -> Geometry {
    Geometry::new(width, height, PixelLayout::Rgb24)
}

fn info() -> StreamInfo {
    StreamInfo::new(geometry(4, 2), 30, SourceKind::Finite)
}

fn frame(seq: u64, geometry: Geometry) -> Frame {
    Frame::new(vec![0u8; geometry.frame_len()], geometry, seq, 0).unwrap()
}

fn segmented(dir: &Path) -> Destination {
    Destination::Segmented(SegmentedOutput {
        dir: dir.to_path_buf(),
        ..Default::default()
    })
}

fn push() -> Destination {
    Destination::Push(PushOutput::from_url("rtmp://127.0.0.1/live/test").unwrap())
}

#[tokio::test]
async fn test_feed_writes_in_order() {
    let launcher = Arc::new(FakeLauncher::new(usize::MAX));
    let journal = Arc::clone(&launcher.journal);
    let sink = EncoderSink::new(launcher, Duration::from_secs(1));

    let mut handle = sink.start(&info(), &push()).unwrap();
    for seq in [3, 4, 9] {
        sink.feed(&mut handle, &frame(seq, geometry(4, 2))).await.unwrap();
    }
    assert_eq!(handle.frames_written(), 3);
    sink.stop(handle).await;

    let journal = journal.lock().unwrap();
    assert_eq!(journal.written, vec![3, 4, 9]);
    assert_eq!(journal.shutdowns, 1);
}

#[tokio::test]
async fn test_geometry_mismatch_is_rejected() {
    let sink = EncoderSink::new(Arc::new(FakeLauncher::new(usize::MAX)), Duration::from_secs(1));
    let mut handle = sink.start(&info(), &push()).unwrap();

    let err = sink
        .feed(&mut handle, &frame(0, geometry(2, 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::GeometryMismatch { .. }));
    // a rejected frame does not close the encoder
    assert!(handle.is_alive());
}

#[tokio::test]
async fn test_broken_pipe_closes_handle() {
    let sink = EncoderSink::new(Arc::new(FakeLauncher::new(2)), Duration::from_secs(1));
    let mut handle = sink.start(&info(), &push()).unwrap();

    sink.feed(&mut handle, &frame(0, geometry(4, 2))).await.unwrap();
    sink.feed(&mut handle, &frame(1, geometry(4, 2))).await.unwrap();
    let err = sink
        .feed(&mut handle, &frame(2, geometry(4, 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Closed(_)));
    assert!(!handle.is_alive());

    // stays closed
    assert!(matches!(
        sink.feed(&mut handle, &frame(3, geometry(4, 2))).await,
        Err(FeedError::Closed(_))
    ));
}

#[tokio::test]
async fn test_exited_process_is_closed() {
    let mut launcher = FakeLauncher::new(usize::MAX);
    launcher.exited = true;
    let sink = EncoderSink::new(Arc::new(launcher), Duration::from_secs(1));
    let mut handle = sink.start(&info(), &push()).unwrap();

    let err = sink
        .feed(&mut handle, &frame(0, geometry(4, 2)))
        .await
        .unwrap_err();
    match err {
        FeedError::Closed(reason) => assert!(reason.contains("exited")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_segmented_start_and_stop_purge_directory() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("hls");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("stale0.ts"), [1u8; 4]).unwrap();

    let sink = EncoderSink::new(Arc::new(FakeLauncher::new(usize::MAX)), Duration::from_secs(1));
    let handle = sink.start(&info(), &segmented(&out)).unwrap();
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

    // what the encoder would have written during the session
    std::fs::write(out.join("stream.m3u8"), "#EXTM3U").unwrap();
    std::fs::write(out.join("stream0.ts"), [1u8; 4]).unwrap();

    sink.stop(handle).await;
    assert!(out.exists());
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
}

#[tokio::test]
async fn test_start_creates_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a").join("b");
    let sink = EncoderSink::new(Arc::new(FakeLauncher::new(usize::MAX)), Duration::from_secs(1));
    let handle = sink.start(&info(), &segmented(&out)).unwrap();
    assert!(out.is_dir());
    sink.stop(handle).await;
}

#[tokio::test]
async fn test_launch_failure() {
    let sink = EncoderSink::new(Arc::new(FailingLauncher), Duration::from_secs(1));
    assert!(matches!(
        sink.start(&info(), &push()),
        Err(EncoderError::Launch(_))
    ));
}
