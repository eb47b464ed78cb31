use crate::capture::{CaptureSource, CaptureTarget, FrameDecoder, LinkType};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::netmap::{NetworkMap, PcapSummary};
use async_trait::async_trait;
use chrono::Utc;
use pcap::{Activated, Capture};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// libpcap backed capture source, live interfaces and capture files.
pub struct PcapSource {
    config: CaptureConfig,
}

impl PcapSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    async fn capture_live(
        &self,
        cancel: CancellationToken,
        interface: &str,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) -> Result<(), CaptureError> {
        let device_error = |e: pcap::Error| CaptureError::Device {
            target: interface.to_string(),
            reason: e.to_string(),
        };
        let cap = Capture::from_device(interface)
            .map_err(device_error)?
            .immediate_mode(true)
            .promisc(self.config.promiscuous)
            .snaplen(self.config.snaplen)
            .timeout(self.config.read_timeout_ms)
            .open()
            .map_err(device_error)?;

        let link = link_type(&cap, interface)?;
        let source = format!("live-{}-{}", interface, Utc::now().format("%Y%m%dT%H%M%SZ"));
        info!("Live capture on {} ({:?}) as {}", interface, link, source);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity.max(1));
        let reader = spawn_reader(cap, interface.to_string(), cancel, tx, true);
        drain(FrameDecoder::new(&source), link, rx, map, summary).await;
        join_reader(reader, interface).await
    }

    async fn capture_file(
        &self,
        cancel: CancellationToken,
        path: &Path,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) -> Result<(), CaptureError> {
        let label = path.display().to_string();
        tokio::fs::metadata(path)
            .await
            .map_err(|source| CaptureError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        // The file exists, so libpcap refusing it means it is not a capture
        let cap = Capture::from_file(path)
            .map_err(|e| CaptureError::Decode(format!("{}: {}", label, e)))?;
        let link = link_type(&cap, &label)?;
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.clone());
        info!("Reading {} ({:?})", label, link);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity.max(1));
        let reader = spawn_reader(cap, label.clone(), cancel, tx, false);
        drain(FrameDecoder::new(&source), link, rx, map, summary).await;
        join_reader(reader, &label).await
    }
}

#[async_trait]
impl CaptureSource for PcapSource {
    async fn capture(
        &self,
        cancel: CancellationToken,
        target: CaptureTarget,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) -> Result<(), CaptureError> {
        match target {
            CaptureTarget::Interface(interface) => {
                self.capture_live(cancel, &interface, map, summary).await
            }
            CaptureTarget::Files(paths) => {
                for path in paths {
                    if cancel.is_cancelled() {
                        info!("Capture file processing cancelled before {}", path.display());
                        break;
                    }
                    // A broken capture file does not spoil the others
                    if let Err(e) = self.capture_file(cancel.clone(), &path, map, summary).await {
                        warn!("Skipping {}: {}", path.display(), e);
                    }
                }
                Ok(())
            }
        }
    }
}

fn link_type<T: Activated + ?Sized>(cap: &Capture<T>, label: &str) -> Result<LinkType, CaptureError> {
    let dlt = cap.get_datalink();
    LinkType::from_dlt(dlt.0).ok_or_else(|| {
        CaptureError::Unsupported(format!("link type {:?} on {}", dlt, label))
    })
}

// Blocking reader thread. The token is polled on every iteration, read
// timeouts included, so a live capture stops within one read timeout.
fn spawn_reader<T: Activated + Send + 'static>(
    mut cap: Capture<T>,
    label: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<Vec<u8>>,
    lossy: bool,
) -> JoinHandle<Result<(), CaptureError>> {
    std::thread::spawn(move || {
        info!("Starting sync pcap reader thread for {}", label);
        let mut dropped_packets = 0u64;
        let mut total_packets = 0u64;
        let mut last_log_time = Instant::now();
        let mut result = Ok(());
        loop {
            if cancel.is_cancelled() {
                info!("Cancellation detected in pcap reader thread for {}", label);
                break;
            }
            match cap.next_packet() {
                Ok(packet) => {
                    total_packets += 1;
                    let data = packet.data.to_vec();
                    if lossy {
                        match tx.try_send(data) {
                            Ok(_) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped_packets += 1;
                                debug!("Decoder channel full for {}, dropping packet", label);
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    } else if tx.blocking_send(data).is_err() {
                        break;
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => {
                    error!("Pcap read error on {}: {}. Stopping reader thread.", label, e);
                    result = Err(CaptureError::Device {
                        target: label.clone(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }

            let now = Instant::now();
            if now.duration_since(last_log_time) >= Duration::from_secs(10) {
                if dropped_packets > 0 {
                    warn!("{}: {} packets, {} dropped", label, total_packets, dropped_packets);
                }
                last_log_time = now;
                dropped_packets = 0;
                total_packets = 0;
            }
        }
        info!("Pcap reader thread for {} finished", label);
        result
    })
}

// Decodes until the reader thread drops its sender, so frames buffered
// before a cancellation are still folded into the session.
async fn drain(
    mut decoder: FrameDecoder,
    link: LinkType,
    mut rx: mpsc::Receiver<Vec<u8>>,
    map: &mut NetworkMap,
    summary: &mut PcapSummary,
) {
    let before = summary.total_packets;
    while let Some(frame) = rx.recv().await {
        decoder.decode(link, &frame, map, summary);
    }
    info!(
        "Decoded {} frame(s) from {}",
        summary.total_packets - before,
        decoder.source()
    );
}

async fn join_reader(
    reader: JoinHandle<Result<(), CaptureError>>,
    label: &str,
) -> Result<(), CaptureError> {
    let label = label.to_string();
    match tokio::task::spawn_blocking(move || reader.join()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) | Err(_) => Err(CaptureError::Device {
            target: label,
            reason: "reader thread panicked".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_capture_file_is_skipped() {
        let source = PcapSource::new(CaptureConfig::default());
        let mut map = NetworkMap::new();
        let mut summary = PcapSummary::new();
        source
            .capture(
                CancellationToken::new(),
                CaptureTarget::Files(vec!["/nonexistent/snailshell.pcap".into()]),
                &mut map,
                &mut summary,
            )
            .await
            .unwrap();
        assert_eq!(summary.total_packets, 0);
    }

    #[tokio::test]
    async fn test_capture_file_errors_are_classified() {
        let source = PcapSource::new(CaptureConfig::default());
        let mut map = NetworkMap::new();
        let mut summary = PcapSummary::new();

        let missing = Path::new("/nonexistent/snailshell.pcap");
        let result = source
            .capture_file(CancellationToken::new(), missing, &mut map, &mut summary)
            .await;
        assert!(matches!(result, Err(CaptureError::Io { .. })), "got {:?}", result);

        let dir = std::env::temp_dir().join(format!("snailshell-pcap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let garbage = dir.join("garbage.pcap");
        std::fs::write(&garbage, b"definitely not a capture file").unwrap();
        let result = source
            .capture_file(CancellationToken::new(), &garbage, &mut map, &mut summary)
            .await;
        assert!(matches!(result, Err(CaptureError::Decode(_))), "got {:?}", result);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unknown_interface_fails() {
        let source = PcapSource::new(CaptureConfig::default());
        let mut map = NetworkMap::new();
        let mut summary = PcapSummary::new();
        let result = source
            .capture(
                CancellationToken::new(),
                CaptureTarget::Interface("snailshell-no-such-if0".to_string()),
                &mut map,
                &mut summary,
            )
            .await;
        assert!(matches!(result, Err(CaptureError::Device { .. })));
    }
}
