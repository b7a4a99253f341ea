//! Renders reassembled images to JPEG.
//!
//! The reassembler marks images as pending whenever a packet was added. The
//! worker picks them up once per interval, so a burst of packets for the same
//! image is rendered only once.

use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    process::{
        ExitStatus,
        Stdio,
    },
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    io::AsyncWriteExt,
    process::Command,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("decoder exited with {status} and no output: {stderr}")]
    Decoder { status: ExitStatus, stderr: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderJob {
    pub instance: i64,
    pub call: String,
    pub image_id: u8,
    /// Concatenated SSDV packets, ordered by packet id.
    pub ssdv: Bytes,
}

/// Images waiting to be rendered, keyed by instance. Scheduling an image that
/// is already pending replaces its data.
#[derive(Clone, Debug, Default)]
pub struct PendingRenders {
    jobs: Arc<Mutex<HashMap<i64, RenderJob>>>,
}

impl PendingRenders {
    pub fn schedule(&self, job: RenderJob) {
        self.jobs.lock().insert(job.instance, job);
    }

    pub fn take(&self) -> Vec<RenderJob> {
        let mut jobs: Vec<RenderJob> = std::mem::take(&mut *self.jobs.lock())
            .into_values()
            .collect();
        jobs.sort_by_key(|job| job.instance);
        jobs
    }
}

/// Turns SSDV packets into a JPEG.
pub trait ImageCodec {
    fn decode(&self, ssdv: Bytes) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
}

/// Runs the `ssdv` command line decoder.
#[derive(Clone, Debug)]
pub struct SsdvCommand {
    program: PathBuf,
}

impl SsdvCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ImageCodec for SsdvCommand {
    async fn decode(&self, ssdv: Bytes) -> Result<Vec<u8>, Error> {
        let mut child = Command::new(&self.program)
            .arg("-d")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Some(mut stdin) = child.stdin.take()
        else {
            return Err(std::io::Error::other("decoder stdin not captured").into());
        };

        // write while reading, the decoder might fill its stdout pipe first
        let write = async move {
            stdin.write_all(&ssdv).await?;
            stdin.shutdown().await
        };
        let (write, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "ssdv");
        }

        // a partially received image still decodes, but ssdv reports the
        // missing packets with an error status
        if output.stdout.is_empty() {
            return Err(Error::Decoder {
                status: output.status,
                stderr: stderr.into_owned(),
            });
        }
        write?;

        Ok(output.stdout)
    }
}

#[derive(Debug)]
pub struct RenderWorker<C> {
    codec: C,
    renders: PendingRenders,
    image_dir: PathBuf,
    interval: Duration,
}

impl<C: ImageCodec> RenderWorker<C> {
    pub fn new(codec: C, renders: PendingRenders, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            renders,
            image_dir: image_dir.into(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.render_pending().await,
            }
        }

        // whatever came in since the last tick
        self.render_pending().await;
        tracing::debug!("render worker stopped");
    }

    async fn render_pending(&self) {
        for job in self.renders.take() {
            match self.render(&job).await {
                Ok(path) => {
                    tracing::info!(call = %job.call, instance = job.instance, path = %path.display(), "rendered image");
                }
                Err(error) => {
                    tracing::debug!(call = %job.call, instance = job.instance, ?error, "failed to render image");
                }
            }
        }
    }

    /// Writes `<CALL>-<instance>.jpg` and copies it to `<CALL>.jpg`, which
    /// always shows the latest image of a sender.
    pub async fn render(&self, job: &RenderJob) -> Result<PathBuf, Error> {
        let jpeg = self.codec.decode(job.ssdv.clone()).await?;

        let name = file_stem(&job.call);
        tokio::fs::create_dir_all(&self.image_dir).await?;

        let path = self.image_dir.join(format!("{name}-{}.jpg", job.instance));
        tokio::fs::write(&path, &jpeg).await?;
        tokio::fs::copy(&path, latest_path(&self.image_dir, &job.call)).await?;

        Ok(path)
    }
}

fn file_stem(call: &str) -> String {
    call.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn latest_path(image_dir: &Path, call: &str) -> PathBuf {
    image_dir.join(format!("{}.jpg", file_stem(call)))
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        time::Duration,
    };

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use crate::image::render::{
        Error,
        ImageCodec,
        PendingRenders,
        RenderJob,
        RenderWorker,
        SsdvCommand,
        latest_path,
    };

    /// Prefixes the input so the output can be told apart.
    struct FakeCodec;

    impl ImageCodec for FakeCodec {
        async fn decode(&self, ssdv: Bytes) -> Result<Vec<u8>, Error> {
            let mut jpeg = b"JPEG".to_vec();
            jpeg.extend_from_slice(&ssdv);
            Ok(jpeg)
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pecan-ingest-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn job(instance: i64, data: &'static [u8]) -> RenderJob {
        RenderJob {
            instance,
            call: "DL7AD-12".to_owned(),
            image_id: 1,
            ssdv: Bytes::from_static(data),
        }
    }

    #[test]
    fn it_keeps_only_the_latest_job_per_instance() {
        let renders = PendingRenders::default();
        renders.schedule(job(2, b"a"));
        renders.schedule(job(1, b"b"));
        renders.schedule(job(2, b"c"));

        let jobs = renders.take();
        assert_eq!(jobs, [job(1, b"b"), job(2, b"c")]);
        assert!(renders.take().is_empty());
    }

    #[tokio::test]
    async fn it_writes_the_image_and_the_latest_copy() {
        let dir = scratch_dir("render");
        let worker = RenderWorker::new(FakeCodec, PendingRenders::default(), &dir);

        let path = worker.render(&job(7, b"ssdv")).await.unwrap();
        assert_eq!(path, dir.join("DL7AD12-7.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"JPEGssdv");
        assert_eq!(
            std::fs::read(latest_path(&dir, "DL7AD-12")).unwrap(),
            b"JPEGssdv"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn it_renders_pending_images_until_shut_down() {
        let dir = scratch_dir("worker");
        let renders = PendingRenders::default();
        let shutdown = CancellationToken::new();

        let worker = RenderWorker::new(FakeCodec, renders.clone(), &dir)
            .with_interval(Duration::from_millis(10));
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        renders.schedule(job(3, b"one"));
        let path = dir.join("DL7AD12-3.jpg");
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"JPEGone");

        // scheduled right before shutdown, still rendered
        renders.schedule(job(4, b"two"));
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(std::fs::read(dir.join("DL7AD12-4.jpg")).unwrap(), b"JPEGtwo");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    /// Fails on `bad`, like `ssdv` on garbage.
    struct PickyCodec;

    impl ImageCodec for PickyCodec {
        async fn decode(&self, ssdv: Bytes) -> Result<Vec<u8>, Error> {
            if ssdv.as_ref() == b"bad" {
                Err(std::io::Error::other("no image").into())
            }
            else {
                FakeCodec.decode(ssdv).await
            }
        }
    }

    #[tokio::test]
    async fn it_skips_images_that_fail_to_render() {
        let dir = scratch_dir("failing");
        let renders = PendingRenders::default();
        renders.schedule(job(1, b"bad"));
        renders.schedule(job(2, b"good"));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        RenderWorker::new(PickyCodec, renders.clone(), &dir)
            .run(shutdown)
            .await;

        assert!(!dir.join("DL7AD12-1.jpg").exists());
        assert_eq!(std::fs::read(dir.join("DL7AD12-2.jpg")).unwrap(), b"JPEGgood");
        assert!(renders.take().is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn it_reports_a_missing_decoder() {
        let codec = SsdvCommand::new("/nonexistent/ssdv");
        let error = codec.decode(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(error, Error::Io(_)));
    }
}
