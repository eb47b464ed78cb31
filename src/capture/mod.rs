pub mod decode;
pub mod files;
pub mod nmap_xml;
#[cfg(feature = "packetcapture")]
pub mod pcap_source;

pub use decode::*;
pub use files::*;
pub use nmap_xml::*;
#[cfg(feature = "packetcapture")]
pub use pcap_source::*;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, ScanError};
use crate::netmap::{NetworkMap, PcapSummary};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Interface(String),
    Files(Vec<PathBuf>),
}

impl CaptureTarget {
    pub fn describe(&self) -> String {
        match self {
            CaptureTarget::Interface(name) => name.clone(),
            CaptureTarget::Files(paths) => format!("{} capture file(s)", paths.len()),
        }
    }
}

/// Produces decoded traffic into the session model.
/// Cancellation is cooperative: the source returns `Ok(())` once it observes
/// the token, and whatever it decoded so far stays in `map` and `summary`.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(
        &self,
        cancel: CancellationToken,
        target: CaptureTarget,
        map: &mut NetworkMap,
        summary: &mut PcapSummary,
    ) -> Result<(), CaptureError>;
}

#[async_trait]
pub trait ScanFileParser: Send + Sync {
    async fn parse_files(
        &self,
        cancel: CancellationToken,
        xml_paths: Vec<PathBuf>,
        capture_paths: Vec<PathBuf>,
    ) -> Result<(NetworkMap, PcapSummary), ScanError>;
}

/// DNS and geolocation lookups attached to the accumulated communications.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, map: &mut NetworkMap, summary: &PcapSummary) -> Result<(), ScanError>;
}

pub struct NoEnrichment;

#[async_trait]
impl Enricher for NoEnrichment {
    async fn enrich(&self, _map: &mut NetworkMap, _summary: &PcapSummary) -> Result<(), ScanError> {
        Ok(())
    }
}

/// Stand-in source for builds without libpcap.
pub struct UnsupportedCapture;

#[async_trait]
impl CaptureSource for UnsupportedCapture {
    async fn capture(
        &self,
        _cancel: CancellationToken,
        target: CaptureTarget,
        _map: &mut NetworkMap,
        _summary: &mut PcapSummary,
    ) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported(format!(
            "cannot capture from {}: built without the packetcapture feature",
            target.describe()
        )))
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn CaptureSource>,
    pub parser: Arc<dyn ScanFileParser>,
    pub enricher: Arc<dyn Enricher>,
}

impl Collaborators {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        parser: Arc<dyn ScanFileParser>,
        enricher: Arc<dyn Enricher>,
    ) -> Self {
        Self {
            capture,
            parser,
            enricher,
        }
    }

    /// The libpcap backed source when compiled in, nmap XML parsing and no enrichment.
    pub fn with_defaults(config: &CaptureConfig) -> Self {
        #[cfg(feature = "packetcapture")]
        let capture: Arc<dyn CaptureSource> = Arc::new(PcapSource::new(config.clone()));
        #[cfg(not(feature = "packetcapture"))]
        let capture: Arc<dyn CaptureSource> = {
            let _ = config;
            Arc::new(UnsupportedCapture)
        };
        let parser = Arc::new(FileScanParser::new(capture.clone()));
        Self::new(capture, parser, Arc::new(NoEnrichment))
    }
}
