use std::{
    path::PathBuf,
    time::Duration,
};

use chrono::Utc;
use clap::Parser;
use color_eyre::eyre::Error;
use pecan_ingest::{
    database::Database,
    forward::{
        self,
        Forwarder,
        HttpUplink,
    },
    image::render::{
        self,
        PendingRenders,
        RenderWorker,
        SsdvCommand,
    },
    pipeline::{
        Pipeline,
        PipelineConfig,
    },
    source::{
        SourceConfig,
        aprs_is,
        serial,
    },
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let database = Database::connect(&args.database_url).await?;
    let renders = PendingRenders::default();
    let shutdown = CancellationToken::new();

    let forwarder = (!args.no_upload).then(|| {
        tracing::info!(server = %args.server, grouping = args.grouping, "uploading packets");
        Forwarder::new(HttpUplink::new(&args.server), args.grouping)
    });

    let render_worker = RenderWorker::new(SsdvCommand::new(&args.ssdv), renders.clone(), &args.image_dir)
        .with_interval(args.render_interval);
    let render_task = tokio::spawn(render_worker.run(shutdown.child_token()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutting down"),
                Err(error) => tracing::error!(?error, "can't listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    let mut pipeline = Pipeline::new(
        PipelineConfig {
            call: args.call.clone(),
        },
        database.clone(),
        renders,
        forwarder.clone(),
    );

    let source = SourceConfig::from_device(&args.device, args.baudrate, &args.aprs_is);
    tracing::info!(?source, call = %args.call, "receiving");

    let result = source
        .run(&args.call, shutdown.clone(), async |line| {
            if let Err(error) = pipeline.handle_line(&line, Utc::now()).await {
                tracing::error!(?error, %line, "failed to process line");
            }
        })
        .await;

    if let Some(forwarder) = forwarder {
        if tokio::time::timeout(args.flush_timeout, forwarder.flush())
            .await
            .is_err()
        {
            tracing::warn!("gave up uploading remaining packets");
        }
    }

    shutdown.cancel();
    render_task.await?;

    tracing::info!(counters = ?pipeline.counters(), "done");

    result?;
    Ok(())
}

#[derive(Debug, Parser)]
pub struct Args {
    /// Our callsign, used for the APRS-IS login and as the receiver of frames
    /// heard directly.
    #[clap(long, env = "PECAN_CALL")]
    call: String,

    /// Serial device of the TNC, `-` for stdin or `I` for APRS-IS.
    #[clap(short, long, env = "PECAN_DEVICE", default_value = "-")]
    device: String,

    #[clap(short, long, default_value_t = serial::DEFAULT_BAUD_RATE)]
    baudrate: u32,

    /// Number of packets per upload.
    #[clap(short, long, default_value_t = 1)]
    grouping: usize,

    #[clap(long, env = "PECAN_SERVER", default_value = forward::DEFAULT_SERVER)]
    server: String,

    #[clap(long)]
    no_upload: bool,

    #[clap(long, env = "DATABASE_URL", default_value = "sqlite://pecan.db")]
    database_url: String,

    /// Path to the `ssdv` decoder.
    #[clap(long, env = "PECAN_SSDV", default_value = "./ssdv")]
    ssdv: PathBuf,

    #[clap(long, default_value = "images")]
    image_dir: PathBuf,

    #[clap(long, default_value = aprs_is::DEFAULT_ADDRESS)]
    aprs_is: String,

    #[clap(long, default_value = "1s", value_parser = humantime::parse_duration)]
    render_interval: Duration,

    /// How long to keep trying to upload pending packets on shutdown.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    flush_timeout: Duration,
}
