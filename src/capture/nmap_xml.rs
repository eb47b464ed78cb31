use crate::capture::{CaptureSource, CaptureTarget, ScanFileParser};
use crate::error::{CaptureError, ScanError};
use crate::netmap::*;
use async_trait::async_trait;
use lazy_static::lazy_static;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

lazy_static! {
    static ref CVE_ID: Regex = Regex::new(r"CVE-\d{4}-\d{4,}").unwrap();
}

fn attributes(element: &BytesStart) -> HashMap<Vec<u8>, String> {
    element
        .attributes()
        .flatten()
        .map(|attr| {
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            (attr.key.as_ref().to_vec(), value)
        })
        .collect()
}

fn attr<'a>(attrs: &'a HashMap<Vec<u8>, String>, key: &str) -> &'a str {
    attrs.get(key.as_bytes()).map(|v| v.as_str()).unwrap_or("")
}

// Vulnerability verdict of an NSE script, if it reports one
fn script_finding(attrs: &HashMap<Vec<u8>, String>, port: u16) -> Option<Vulnerability> {
    let output = attr(attrs, "output");
    let category = if output.contains("LIKELY VULNERABLE") {
        FindingCategory::Potential
    } else if output.contains("VULNERABLE") {
        FindingCategory::Critical
    } else {
        return None;
    };
    let id = attr(attrs, "id");
    let cve = CVE_ID
        .find(output)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| id.to_string());
    Some(Vulnerability {
        cve,
        description: id.to_string(),
        state: if category == FindingCategory::Critical {
            "VULNERABLE".to_string()
        } else {
            "LIKELY VULNERABLE".to_string()
        },
        category,
        port: Some(port),
    })
}

/// Hosts of an nmap XML report. Hosts reported without a MAC address are kept
/// under a synthetic `ip:<addr>` identity.
pub fn parse_nmap_xml(xml: &str) -> Result<NetworkMap, ScanError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut map = NetworkMap::new();
    let mut host: Option<Host> = None;
    let mut port: Option<Port> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ScanError::Parse(format!(
                "XML error at position {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let attrs = attributes(e);
                match (e.name().as_ref(), host.as_mut()) {
                    (b"host", _) if !empty => {
                        let mut fresh = Host::default();
                        fresh.discovered_by = "nmap".to_string();
                        host = Some(fresh);
                    }
                    (b"status", Some(h)) => h.status = HostStatus::parse(attr(&attrs, "state")),
                    (b"address", Some(h)) => match attr(&attrs, "addrtype") {
                        "ipv4" => h.add_ip(attr(&attrs, "addr")),
                        "mac" => {
                            h.mac_address = identity_key(attr(&attrs, "addr"));
                            let vendor = attr(&attrs, "vendor");
                            if !vendor.is_empty() {
                                h.fingerprint.vendor = vendor.to_string();
                            }
                        }
                        _ => {}
                    },
                    (b"port", Some(h)) => {
                        let Ok(number) = attr(&attrs, "portid").parse::<u16>() else {
                            continue;
                        };
                        let fresh = Port::new(number, attr(&attrs, "protocol"));
                        if empty {
                            h.add_port(fresh);
                        } else {
                            port = Some(fresh);
                        }
                    }
                    (b"state", Some(_)) => {
                        if let Some(p) = port.as_mut() {
                            p.state = attr(&attrs, "state").to_string();
                        }
                    }
                    (b"service", Some(_)) => {
                        if let Some(p) = port.as_mut() {
                            p.service = attr(&attrs, "name").to_string();
                            p.version = format!("{} {}", attr(&attrs, "product"), attr(&attrs, "version"))
                                .trim()
                                .to_string();
                        }
                    }
                    (b"script", Some(h)) => {
                        if let Some(number) = port.as_ref().map(|p| p.number) {
                            if let Some(finding) = script_finding(&attrs, number) {
                                h.add_finding(finding);
                            }
                        }
                    }
                    (b"osmatch", Some(h)) => {
                        // First match carries the highest accuracy
                        if h.fingerprint.operating_system.is_empty() {
                            h.fingerprint.operating_system = attr(&attrs, "name").to_string();
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"port" => {
                    if let (Some(h), Some(p)) = (host.as_mut(), port.take()) {
                        h.add_port(p);
                    }
                }
                b"host" => {
                    if let Some(h) = host.take() {
                        map.merge_observation(h);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(map)
}

/// Reads and parses one nmap XML report file.
pub async fn read_nmap_report(path: &Path) -> Result<NetworkMap, ScanError> {
    let xml = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_nmap_xml(&xml)
}

/// Scan-file collaborator: nmap XML reports first, then the capture files
/// through the configured capture source.
pub struct FileScanParser {
    capture: Arc<dyn CaptureSource>,
}

impl FileScanParser {
    pub fn new(capture: Arc<dyn CaptureSource>) -> Self {
        Self { capture }
    }
}

#[async_trait]
impl ScanFileParser for FileScanParser {
    async fn parse_files(
        &self,
        cancel: CancellationToken,
        xml_paths: Vec<PathBuf>,
        capture_paths: Vec<PathBuf>,
    ) -> Result<(NetworkMap, PcapSummary), ScanError> {
        let mut map = NetworkMap::new();
        let mut summary = PcapSummary::new();

        for path in &xml_paths {
            if cancel.is_cancelled() {
                info!("File processing cancelled before {}", path.display());
                return Ok((map, summary));
            }
            match read_nmap_report(path).await {
                Ok(parsed) => {
                    info!("Parsed {} host(s) from {}", parsed.len(), path.display());
                    map.merge(parsed);
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        if !capture_paths.is_empty() && !cancel.is_cancelled() {
            self.capture
                .capture(
                    cancel,
                    CaptureTarget::Files(capture_paths),
                    &mut map,
                    &mut summary,
                )
                .await?;
        }
        Ok((map, summary))
    }
}
