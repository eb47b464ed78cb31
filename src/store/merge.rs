use crate::error::{SqliteContext, StoreError};
use crate::netmap::*;
use crate::store::Store;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// How a host of the session was matched against the campaign's stored hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIdentity {
    ByMac(i64),
    ByIp(i64),
    New,
}

impl HostIdentity {
    pub fn host_id(&self) -> Option<i64> {
        match self {
            HostIdentity::ByMac(id) | HostIdentity::ByIp(id) => Some(*id),
            HostIdentity::New => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub hosts_inserted: usize,
    pub hosts_updated: usize,
    pub ports_upserted: usize,
    pub findings: usize,
    pub communications: usize,
    pub dns_lookups: usize,
    pub probe_results: usize,
    pub probe_results_skipped: usize,
    pub handshakes: usize,
    pub credentials_stored: usize,
    pub credentials_dropped: usize,
}

/// MAC first, then the primary IP. MAC addresses are the stable identity
/// signal; IP addresses get reused by other devices over time.
pub fn resolve_host_identity(
    tx: &Transaction,
    campaign_id: i64,
    mac: &str,
    primary_ip: Option<&str>,
) -> Result<HostIdentity, StoreError> {
    if !mac.is_empty() {
        let by_mac: Option<i64> = tx
            .query_row(
                "SELECT id FROM hosts WHERE campaign_id = ?1 AND mac_address = ?2 ORDER BY id LIMIT 1",
                params![campaign_id, mac],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("look up host by MAC {}", mac))?;
        if let Some(id) = by_mac {
            return Ok(HostIdentity::ByMac(id));
        }
    }

    if let Some(ip) = primary_ip {
        let by_ip: Option<i64> = tx
            .query_row(
                "SELECT id FROM hosts WHERE campaign_id = ?1 AND ip_address = ?2 ORDER BY id LIMIT 1",
                params![campaign_id, ip],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("look up host by IP {}", ip))?;
        if let Some(id) = by_ip {
            return Ok(HostIdentity::ByIp(id));
        }
    }

    Ok(HostIdentity::New)
}

impl Store {
    /// Merges one session into the campaign inside a single transaction.
    /// Either the whole session lands or nothing does. Store ids are written
    /// back to the hosts of `map` once the transaction has committed.
    pub fn save_scan_results(
        &self,
        campaign_id: i64,
        map: &mut NetworkMap,
        summary: &PcapSummary,
    ) -> Result<SaveReport, StoreError> {
        let mut report = SaveReport::default();
        let mut assigned: Vec<(String, i64)> = Vec::with_capacity(map.len());

        let mut conn = self.connection().lock();
        let tx = conn
            .transaction()
            .with_context(|| format!("begin save for campaign {}", campaign_id))?;

        for (key, host) in map.hosts.iter() {
            let host_id = save_host(&tx, campaign_id, host, &mut report)?;
            let ports = save_ports(&tx, host_id, host, &mut report)?;
            save_host_records(&tx, host_id, host, &ports, &mut report)?;
            save_probe_results(&tx, host_id, host, &ports, &mut report)?;
            assigned.push((key.clone(), host_id));
        }

        for handshake in &summary.handshakes {
            tx.execute(
                "INSERT INTO handshakes (campaign_id, ap_mac, client_mac, ssid, state, pcap_file, key_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    campaign_id,
                    handshake.ap_mac,
                    handshake.client_mac,
                    handshake.ssid,
                    handshake.state.to_string(),
                    handshake.pcap_file,
                    handshake.key_data,
                ],
            )
            .with_context(|| {
                format!(
                    "save handshake {} / {} for campaign {}",
                    handshake.ap_mac, handshake.client_mac, campaign_id
                )
            })?;
            report.handshakes += 1;
        }

        for credential in &summary.credentials {
            // Credentials only attach to a host known by MAC, never by IP
            let mac = normalize_mac(&credential.host_mac).unwrap_or_default();
            let host_id: Option<i64> = if mac.is_empty() {
                None
            } else {
                tx.query_row(
                    "SELECT id FROM hosts WHERE campaign_id = ?1 AND mac_address = ?2 ORDER BY id LIMIT 1",
                    params![campaign_id, mac],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("look up credential owner {}", mac))?
            };

            let host_id = match host_id {
                Some(id) => id,
                None => {
                    warn!(
                        "No host with MAC '{}' in campaign {} for {} credential on {}, skipping",
                        credential.host_mac, campaign_id, credential.credential_type, credential.endpoint
                    );
                    report.credentials_dropped += 1;
                    continue;
                }
            };

            tx.execute(
                "INSERT INTO credentials (campaign_id, host_id, endpoint, type, value, pcap_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    campaign_id,
                    host_id,
                    credential.endpoint,
                    credential.credential_type,
                    credential.value,
                    credential.pcap_file,
                ],
            )
            .with_context(|| format!("save credential for host {}", host_id))?;
            report.credentials_stored += 1;
        }

        tx.commit()
            .with_context(|| format!("commit save for campaign {}", campaign_id))?;
        drop(conn);

        for (key, host_id) in assigned {
            if let Some(host) = map.hosts.get_mut(&key) {
                host.id = host_id;
            }
        }

        info!(
            "Saved campaign {}: {} new host(s), {} updated, {} port(s), {} handshake(s), {} credential(s) ({} dropped)",
            campaign_id,
            report.hosts_inserted,
            report.hosts_updated,
            report.ports_upserted,
            report.handshakes,
            report.credentials_stored,
            report.credentials_dropped
        );
        Ok(report)
    }
}

fn save_host(
    tx: &Transaction,
    campaign_id: i64,
    host: &Host,
    report: &mut SaveReport,
) -> Result<i64, StoreError> {
    // Synthetic identities (hosts seen without a MAC) are stored without one
    let mac = normalize_mac(&host.mac_address).unwrap_or_default();
    let primary_ip = host.primary_ip();
    let fp = &host.fingerprint;
    let clues = fp.clues_joined();

    match resolve_host_identity(tx, campaign_id, &mac, primary_ip)? {
        HostIdentity::ByMac(id) | HostIdentity::ByIp(id) => {
            // Empty incoming values keep what is already stored
            tx.execute(
                "UPDATE hosts SET
                    ip_address = COALESCE(NULLIF(?1, ''), ip_address),
                    os_guess = COALESCE(NULLIF(?2, ''), os_guess),
                    vendor = COALESCE(NULLIF(?3, ''), vendor),
                    status = COALESCE(NULLIF(?4, ''), status),
                    device_type = COALESCE(NULLIF(?5, ''), device_type),
                    behavioral_clues = COALESCE(NULLIF(?6, ''), behavioral_clues),
                    mac_address = COALESCE(NULLIF(?7, ''), mac_address)
                 WHERE id = ?8",
                params![
                    primary_ip.unwrap_or(""),
                    fp.operating_system,
                    fp.vendor,
                    host.status.to_string(),
                    fp.device_type,
                    clues,
                    mac,
                    id
                ],
            )
            .with_context(|| format!("update host {} ({})", id, host.mac_address))?;
            debug!("Updated host {} from {}", id, host.mac_address);
            report.hosts_updated += 1;
            Ok(id)
        }
        HostIdentity::New => {
            tx.execute(
                "INSERT INTO hosts (campaign_id, mac_address, ip_address, os_guess, vendor, status, discovered_by, device_type, behavioral_clues)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    campaign_id,
                    mac,
                    primary_ip.unwrap_or(""),
                    fp.operating_system,
                    fp.vendor,
                    host.status.to_string(),
                    host.discovered_by,
                    fp.device_type,
                    clues
                ],
            )
            .with_context(|| format!("insert host {}", host.mac_address))?;
            report.hosts_inserted += 1;
            Ok(tx.last_insert_rowid())
        }
    }
}

// Returns port number -> port row id for the ports persisted this session
fn save_ports(
    tx: &Transaction,
    host_id: i64,
    host: &Host,
    report: &mut SaveReport,
) -> Result<HashMap<u16, i64>, StoreError> {
    let mut ids = HashMap::with_capacity(host.ports.len());
    for port in host.ports.values() {
        let protocol = if port.protocol.is_empty() {
            "tcp"
        } else {
            port.protocol.as_str()
        };
        let port_id: i64 = tx
            .query_row(
                "INSERT INTO ports (host_id, port_number, protocol, state, service, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(host_id, port_number, protocol) DO UPDATE SET
                    state = CASE WHEN excluded.state = '' THEN ports.state ELSE excluded.state END,
                    service = CASE WHEN excluded.service = '' THEN ports.service ELSE excluded.service END,
                    version = CASE WHEN excluded.version = '' THEN ports.version ELSE excluded.version END
                 RETURNING id",
                params![
                    host_id,
                    port.number,
                    protocol,
                    port.state,
                    port.service,
                    port.version
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("save port {}/{} for host {}", port.number, protocol, host_id))?;
        ids.insert(port.number, port_id);
        report.ports_upserted += 1;
    }
    Ok(ids)
}

fn save_host_records(
    tx: &Transaction,
    host_id: i64,
    host: &Host,
    ports: &HashMap<u16, i64>,
    report: &mut SaveReport,
) -> Result<(), StoreError> {
    for vuln in host.findings.values().flatten() {
        let port_id = vuln.port.and_then(|number| ports.get(&number).copied());
        tx.execute(
            "INSERT INTO vulnerabilities (host_id, port_id, cve, description, state, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                host_id,
                port_id,
                vuln.cve,
                vuln.description,
                vuln.state,
                vuln.category.to_string()
            ],
        )
        .with_context(|| format!("save finding {} for host {}", vuln.cve, host_id))?;
        report.findings += 1;
    }

    for comm in host.communications.values() {
        let geo = comm.geo.as_ref();
        tx.execute(
            "INSERT INTO communications (host_id, counterpart_ip, packet_count, geo_country, geo_city, geo_isp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                host_id,
                comm.counterpart_ip,
                comm.packet_count as i64,
                geo.map(|g| g.country.as_str()),
                geo.map(|g| g.city.as_str()),
                geo.map(|g| g.isp.as_str())
            ],
        )
        .with_context(|| format!("save communication {} for host {}", comm.counterpart_ip, host_id))?;
        report.communications += 1;
    }

    for domain in &host.dns_lookups {
        report.dns_lookups += tx
            .execute(
                "INSERT OR IGNORE INTO dns_lookups (host_id, domain) VALUES (?1, ?2)",
                params![host_id, domain],
            )
            .with_context(|| format!("save DNS lookup {} for host {}", domain, host_id))?;
    }
    Ok(())
}

fn resolve_probe_port(
    ports: &HashMap<u16, i64>,
    host: &Host,
    kind: &str,
    port: u16,
    report: &mut SaveReport,
) -> Option<i64> {
    match ports.get(&port) {
        Some(id) => {
            report.probe_results += 1;
            Some(*id)
        }
        None => {
            warn!(
                "Skipping {} result for {} port {}: port not recorded this session",
                kind, host.mac_address, port
            );
            report.probe_results_skipped += 1;
            None
        }
    }
}

fn save_probe_results(
    tx: &Transaction,
    host_id: i64,
    host: &Host,
    ports: &HashMap<u16, i64>,
    report: &mut SaveReport,
) -> Result<(), StoreError> {
    for web in &host.web_responses {
        let Some(port_id) = resolve_probe_port(ports, host, "web", web.port, report) else {
            continue;
        };
        let headers = serde_json::to_string(&web.headers)?;
        tx.execute(
            "INSERT INTO web_responses (host_id, port_id, method, status_code, headers) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![host_id, port_id, web.method, web.status_code, headers],
        )
        .with_context(|| format!("save web response for host {}", host_id))?;
    }

    for shot in &host.screenshots {
        let Some(port_id) = resolve_probe_port(ports, host, "screenshot", shot.port, report) else {
            continue;
        };
        tx.execute(
            "INSERT INTO screenshots (host_id, port_id, image_data, capture_time) VALUES (?1, ?2, ?3, ?4)",
            params![host_id, port_id, shot.image_data, shot.capture_time.to_rfc3339()],
        )
        .with_context(|| format!("save screenshot for host {}", host_id))?;
    }

    for ftp in &host.ftp_results {
        let Some(port_id) = resolve_probe_port(ports, host, "ftp", ftp.port, report) else {
            continue;
        };
        tx.execute(
            "INSERT INTO ftp_results (host_id, port_id, address, status, error, anonymous_login_possible, current_dir, directory_listing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                host_id,
                port_id,
                ftp.address,
                ftp.status,
                ftp.error,
                ftp.anonymous_login_possible,
                ftp.current_dir,
                ftp.directory_listing.join("\n")
            ],
        )
        .with_context(|| format!("save ftp result for host {}", host_id))?;
    }

    for ssh in &host.ssh_results {
        let Some(port_id) = resolve_probe_port(ports, host, "ssh", ssh.port, report) else {
            continue;
        };
        tx.execute(
            "INSERT INTO ssh_results (host_id, port_id, address, user, status, error, successful, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                host_id,
                port_id,
                ssh.address,
                ssh.user,
                ssh.status,
                ssh.error,
                ssh.successful,
                ssh.output
            ],
        )
        .with_context(|| format!("save ssh result for host {}", host_id))?;
    }

    for smb in &host.smb_results {
        let Some(port_id) = resolve_probe_port(ports, host, "smb", smb.port, report) else {
            continue;
        };
        tx.execute(
            "INSERT INTO smb_results (host_id, port_id, address, status, error, successful, shares)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                host_id,
                port_id,
                smb.address,
                smb.status,
                smb.error,
                smb.successful,
                smb.shares.join("\n")
            ],
        )
        .with_context(|| format!("save smb result for host {}", host_id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host(mac: &str, ip: &str) -> Host {
        let mut host = Host::new(mac);
        host.add_ip(ip);
        host.status = HostStatus::Up;
        host.discovered_by = "nmap".to_string();
        host.fingerprint.vendor = "Acme".to_string();
        host.add_port(Port {
            number: 22,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: "ssh".to_string(),
            version: "OpenSSH 9.6".to_string(),
        });
        host.add_port(Port {
            number: 80,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            service: "http".to_string(),
            version: String::new(),
        });
        host.dns_lookups.insert("example.com".to_string());
        host
    }

    fn count(store: &Store, sql: &str) -> i64 {
        store
            .connection()
            .lock()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_save_is_idempotent_for_hosts_and_ports() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("idempotent").unwrap();

        let mut map = NetworkMap::new();
        map.merge_observation(sample_host("aa:bb:cc:dd:ee:01", "10.0.0.1"));
        map.merge_observation(sample_host("aa:bb:cc:dd:ee:02", "10.0.0.2"));
        let summary = PcapSummary::new();

        let first = store.save_scan_results(campaign, &mut map, &summary).unwrap();
        assert_eq!(first.hosts_inserted, 2);
        let first_ids: Vec<i64> = map.hosts.values().map(|h| h.id).collect();
        let first_port_ids: Vec<i64> = {
            let conn = store.connection().lock();
            let mut stmt = conn.prepare("SELECT id FROM ports ORDER BY id").unwrap();
            let ids = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            ids
        };

        let second = store.save_scan_results(campaign, &mut map, &summary).unwrap();
        assert_eq!(second.hosts_inserted, 0);
        assert_eq!(second.hosts_updated, 2);
        let second_ids: Vec<i64> = map.hosts.values().map(|h| h.id).collect();
        assert_eq!(first_ids, second_ids);

        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 2);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM ports"), 4);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM dns_lookups"), 2);
        let port_ids_after: i64 = count(&store, "SELECT MAX(id) FROM ports");
        assert_eq!(port_ids_after, *first_port_ids.last().unwrap());
    }

    #[test]
    fn test_same_mac_new_ip_updates_single_row() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("moving-host").unwrap();

        let mut file_scan = NetworkMap::new();
        file_scan.merge_observation(sample_host("aa:bb:cc:dd:ee:ff", "10.0.0.5"));
        store
            .save_scan_results(campaign, &mut file_scan, &PcapSummary::new())
            .unwrap();

        let mut capture = NetworkMap::new();
        let mut seen = Host::new("AA:BB:CC:DD:EE:FF");
        seen.add_ip("10.0.0.9");
        capture.merge_observation(seen);
        store
            .save_scan_results(campaign, &mut capture, &PcapSummary::new())
            .unwrap();

        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 1);
        let (mac, ip, vendor): (String, String, String) = store
            .connection()
            .lock()
            .query_row("SELECT mac_address, ip_address, vendor FROM hosts", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(ip, "10.0.0.9");
        assert_eq!(vendor, "Acme", "Empty vendor must not erase the stored one");
    }

    #[test]
    fn test_ip_fallback_adopts_mac() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("ip-fallback").unwrap();

        let mut first = NetworkMap::new();
        first.merge_observation(sample_host("", "192.168.1.20"));
        store
            .save_scan_results(campaign, &mut first, &PcapSummary::new())
            .unwrap();

        let mut second = NetworkMap::new();
        second.merge_observation(sample_host("00:11:22:33:44:55", "192.168.1.20"));
        let report = store
            .save_scan_results(campaign, &mut second, &PcapSummary::new())
            .unwrap();

        assert_eq!(report.hosts_updated, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 1);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM hosts WHERE mac_address = '00:11:22:33:44:55'"),
            1
        );
    }

    #[test]
    fn test_resolve_prefers_mac_over_ip() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("resolve").unwrap();
        let mut map = NetworkMap::new();
        map.merge_observation(sample_host("aa:aa:aa:aa:aa:01", "10.0.0.1"));
        map.merge_observation(sample_host("aa:aa:aa:aa:aa:02", "10.0.0.2"));
        store
            .save_scan_results(campaign, &mut map, &PcapSummary::new())
            .unwrap();
        let id_1 = map.get("aa:aa:aa:aa:aa:01").unwrap().id;
        let id_2 = map.get("aa:aa:aa:aa:aa:02").unwrap().id;

        let mut conn = store.connection().lock();
        let tx = conn.transaction().unwrap();
        assert_eq!(
            resolve_host_identity(&tx, campaign, "aa:aa:aa:aa:aa:01", Some("10.0.0.2")).unwrap(),
            HostIdentity::ByMac(id_1)
        );
        assert_eq!(
            resolve_host_identity(&tx, campaign, "aa:aa:aa:aa:aa:99", Some("10.0.0.2")).unwrap(),
            HostIdentity::ByIp(id_2)
        );
        assert_eq!(
            resolve_host_identity(&tx, campaign, "aa:aa:aa:aa:aa:99", None).unwrap(),
            HostIdentity::New
        );
        assert_eq!(
            resolve_host_identity(&tx, campaign + 1, "aa:aa:aa:aa:aa:01", None).unwrap(),
            HostIdentity::New,
            "Identity never crosses campaigns"
        );
    }

    #[test]
    fn test_unknown_credential_owner_is_dropped() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("creds").unwrap();

        let mut map = NetworkMap::new();
        map.merge_observation(sample_host("aa:bb:cc:dd:ee:01", "10.0.0.1"));
        let mut summary = PcapSummary::new();
        summary.credentials.push(Credential {
            host_mac: "AA:BB:CC:DD:EE:01".to_string(),
            endpoint: "10.0.0.50:21".to_string(),
            credential_type: "FTP".to_string(),
            value: "admin:hunter2".to_string(),
            pcap_file: "a.pcap".to_string(),
            ..Default::default()
        });
        summary.credentials.push(Credential {
            host_mac: "de:ad:be:ef:00:00".to_string(),
            endpoint: "10.0.0.1:110".to_string(),
            credential_type: "POP3".to_string(),
            value: "bob:pw".to_string(),
            pcap_file: "a.pcap".to_string(),
            ..Default::default()
        });

        let report = store.save_scan_results(campaign, &mut map, &summary).unwrap();
        assert_eq!(report.credentials_stored, 1);
        assert_eq!(report.credentials_dropped, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM credentials"), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 1, "Other data still persists");
    }

    #[test]
    fn test_probe_results_need_a_persisted_port() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("probes").unwrap();

        let mut host = sample_host("aa:bb:cc:dd:ee:01", "10.0.0.1");
        host.ssh_results.push(SshResult {
            port: 22,
            address: "10.0.0.1:22".to_string(),
            user: "root".to_string(),
            status: "failed".to_string(),
            ..Default::default()
        });
        host.ftp_results.push(FtpResult {
            port: 21,
            address: "10.0.0.1:21".to_string(),
            status: "ok".to_string(),
            ..Default::default()
        });
        host.screenshots.push(Screenshot::new(80, vec![1, 2, 3]));
        host.add_finding(Vulnerability {
            cve: "CVE-2023-38408".to_string(),
            description: "ssh-agent".to_string(),
            state: "VULNERABLE".to_string(),
            category: FindingCategory::Critical,
            port: Some(22),
        });
        host.add_finding(Vulnerability {
            cve: "CVE-0000-0000".to_string(),
            description: "unbound port".to_string(),
            state: "LIKELY".to_string(),
            category: FindingCategory::Potential,
            port: Some(9999),
        });
        let mut map = NetworkMap::new();
        map.merge_observation(host);

        let report = store
            .save_scan_results(campaign, &mut map, &PcapSummary::new())
            .unwrap();
        assert_eq!(report.probe_results, 2);
        assert_eq!(report.probe_results_skipped, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM ftp_results"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM vulnerabilities"), 2);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM vulnerabilities WHERE port_id IS NULL"),
            1
        );
    }

    #[test]
    fn test_failed_save_rolls_back_everything() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("atomic").unwrap();

        let mut map = NetworkMap::new();
        map.merge_observation(sample_host("aa:bb:cc:dd:ee:01", "10.0.0.1"));
        let mut summary = PcapSummary::new();
        summary.handshakes.push(Handshake {
            id: 0,
            client_mac: "11:22:33:44:55:66".to_string(),
            ap_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            ssid: "lab".to_string(),
            pcap_file: "a.pcap".to_string(),
            key_data: vec![0u8; 4],
            state: HandshakeState::Partial,
        });

        // Unknown campaign violates the foreign keys partway through the session
        let err = store.save_scan_results(campaign + 100, &mut map, &summary);
        assert!(err.is_err());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM handshakes"), 0);
        assert_eq!(map.get("aa:bb:cc:dd:ee:01").unwrap().id, 0, "Ids only assigned after commit");
    }

    #[test]
    fn test_late_failure_undoes_written_hosts() {
        let store = Store::open_in_memory().unwrap();
        let campaign = store.get_or_create_campaign("atomic").unwrap();
        store
            .connection()
            .lock()
            .execute_batch(
                "CREATE TRIGGER reject_handshakes BEFORE INSERT ON handshakes
                 BEGIN SELECT RAISE(ABORT, 'handshake storage offline'); END;",
            )
            .unwrap();

        let mut map = NetworkMap::new();
        for (mac, ip) in [("aa:bb:cc:dd:ee:01", "10.0.0.1"), ("aa:bb:cc:dd:ee:02", "10.0.0.2")] {
            let mut host = sample_host(mac, ip);
            host.add_finding(Vulnerability {
                cve: "CVE-2024-6387".to_string(),
                description: "regreSSHion".to_string(),
                state: "VULNERABLE".to_string(),
                category: FindingCategory::Critical,
                port: Some(22),
            });
            host.record_communication("8.8.8.8", 4);
            map.merge_observation(host);
        }
        let mut summary = PcapSummary::new();
        summary.handshakes.push(Handshake {
            id: 0,
            client_mac: "aa:bb:cc:dd:ee:02".to_string(),
            ap_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            ssid: "lab".to_string(),
            pcap_file: "a.pcap".to_string(),
            key_data: vec![0u8; 4],
            state: HandshakeState::Partial,
        });

        // Hosts, ports and findings are written before the handshake insert aborts
        let err = store.save_scan_results(campaign, &mut map, &summary).unwrap_err();
        assert!(err.to_string().contains("handshake"), "got {}", err);

        assert_eq!(count(&store, "SELECT COUNT(*) FROM hosts"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM ports"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM vulnerabilities"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM communications"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM dns_lookups"), 0);
        assert!(map.hosts.values().all(|host| host.id == 0));

        store
            .connection()
            .lock()
            .execute_batch("DROP TRIGGER reject_handshakes;")
            .unwrap();
        let report = store.save_scan_results(campaign, &mut map, &summary).unwrap();
        assert_eq!(report.hosts_inserted, 2, "Nothing left behind by the failed save");
        assert_eq!(report.handshakes, 1);
    }
}
