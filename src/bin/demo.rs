//! Локальная трансляция: один хост и несколько зрителей в одном процессе,
//! сигналинг через `MemoryChannel`, медиа через настоящий webrtc-rs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use livecast_lib::utils::random_id;
use livecast_lib::{
    join_stream, logger, start_hosting, LocalMedia, MemoryChannel, Session, SessionEvent,
    SessionId, SignalConfig, ViewerId, WebRtcEngine,
};

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Parser, Debug)]
#[command(name = "livecast-demo")]
#[command(about = "Loopback live stream: one host, N viewers over an in-process channel")]
struct Args {
    /// Number of viewers to join
    #[arg(long, default_value_t = 2)]
    viewers: usize,

    /// How long to keep the stream running
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// JSON config (ICE servers, timeouts, retries)
    #[arg(long, env = "LIVECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Session id; random if omitted
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SignalConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SignalConfig::default(),
    };
    logger::init(Some(&config));

    let session = Session::new(
        args.session.clone().map(SessionId::from).unwrap_or_else(SessionId::random),
        format!("host-{}", random_id()),
    );
    let channel = Arc::new(MemoryChannel::new());
    let engine = Arc::new(WebRtcEngine::new(config.clone()));

    let video = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        session.id.to_string(),
    ));
    let track: Arc<dyn TrackLocal + Send + Sync> = video.clone();
    let media = LocalMedia::new(vec![track]);

    let host = start_hosting(
        channel.clone(),
        engine.clone(),
        session.clone(),
        media,
        config.clone(),
    )
    .await
    .context("failed to start hosting")?;

    let mut events = host.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ViewerConnected { viewer_id } => {
                    info!(viewer = %viewer_id, "demo: viewer is receiving media")
                }
                other => debug!(?other, "demo: session event"),
            }
        }
    });

    let frames = CancellationToken::new();
    tokio::spawn(write_frames(video, frames.clone()));

    let mut viewers = Vec::with_capacity(args.viewers);
    for n in 0..args.viewers {
        let viewer_id = ViewerId::from(format!("viewer-{n}"));
        let viewer = join_stream(
            channel.clone(),
            engine.clone(),
            session.id.clone(),
            viewer_id.clone(),
            move |stream| {
                info!(viewer = %viewer_id, stream = %stream.stream_id, "demo: remote stream");
                if let Some(track) = stream.track {
                    tokio::spawn(async move {
                        let mut packets = 0u64;
                        while track.read_rtp().await.is_ok() {
                            packets += 1;
                            if packets % 100 == 0 {
                                debug!(viewer = %viewer_id, packets, "demo: rtp received");
                            }
                        }
                    });
                }
            },
            config.clone(),
        )
        .await
        .with_context(|| format!("viewer {n} failed to join"))?;
        viewers.push(viewer);
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    for viewer_id in host.viewer_ids() {
        info!(viewer = %viewer_id, state = ?host.viewer_state(&viewer_id), "demo: host side");
    }
    for viewer in &viewers {
        info!(viewer = %viewer.viewer_id(), state = %viewer.state(), "demo: viewer side");
        viewer.cancel().await;
    }
    host.cancel().await;
    frames.cancel();
    info!(session = %session.id, "demo finished");
    Ok(())
}

/// Пишет фиктивные VP8 кадры, пока не отменят
async fn write_frames(track: Arc<TrackLocalStaticSample>, token: CancellationToken) {
    let frame = Bytes::from_static(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00]);
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let sample = Sample {
                    data: frame.clone(),
                    duration: FRAME_INTERVAL,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn!(error = %e, "demo: failed to write sample");
                    break;
                }
            }
        }
    }
}
