use crate::error::{SqliteContext, StoreError};
use crate::netmap::*;
use crate::store::{parse_timestamp, Campaign, Store};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HostFilter {
    #[default]
    All,
    Up,
    Down,
    #[strum(serialize = "vulns", serialize = "vulnerable")]
    Vulnerable,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostRow {
    pub id: i64,
    pub mac_address: String,
    pub ip_address: String,
    pub vendor: String,
    pub os_guess: String,
    pub status: String,
    pub discovered_by: String,
    pub device_type: String,
    pub has_vulns: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HandshakeRow {
    pub id: i64,
    pub ap_mac: String,
    pub client_mac: String,
    pub ssid: String,
    pub state: String,
    pub pcap_file: String,
    // Lowercase hex of the HCCAPX record
    pub key_data_hex: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DashboardSummary {
    pub total_hosts: i64,
    pub hosts_up: i64,
    pub hosts_down: i64,
    pub most_common_ports: Vec<u16>,
    pub critical_findings: i64,
    pub potential_findings: i64,
    pub informational_findings: i64,
    pub total_findings: i64,
    pub handshakes: i64,
    pub credentials: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CampaignExport {
    pub campaign: Campaign,
    pub hosts: Vec<Host>,
    pub handshakes: Vec<HandshakeRow>,
    pub credentials: Vec<Credential>,
}

const HOST_COLUMNS: &str = "h.id, h.mac_address, h.ip_address, h.vendor, h.os_guess, h.status, h.discovered_by, h.device_type,
    EXISTS (SELECT 1 FROM vulnerabilities v WHERE v.host_id = h.id)";

fn host_row(row: &rusqlite::Row) -> rusqlite::Result<HostRow> {
    Ok(HostRow {
        id: row.get(0)?,
        mac_address: row.get(1)?,
        ip_address: row.get(2)?,
        vendor: row.get(3)?,
        os_guess: row.get(4)?,
        status: row.get(5)?,
        discovered_by: row.get(6)?,
        device_type: row.get(7)?,
        has_vulns: row.get(8)?,
    })
}

fn count(conn: &Connection, sql: &str, campaign_id: i64) -> Result<i64, StoreError> {
    conn.query_row(sql, params![campaign_id], |row| row.get(0))
        .with_context(|| format!("count for campaign {}", campaign_id))
}

impl Store {
    /// One page of hosts plus the total number of hosts matching the filter.
    /// A zero `limit` returns a page of the configured size.
    pub fn get_hosts_paginated(
        &self,
        campaign_id: i64,
        limit: u32,
        offset: u32,
        search: &str,
        filter: HostFilter,
    ) -> Result<(Vec<HostRow>, i64), StoreError> {
        let mut conditions = vec!["h.campaign_id = ?".to_string()];
        let mut args: Vec<rusqlite::types::Value> = vec![campaign_id.into()];

        match filter {
            HostFilter::All => {}
            HostFilter::Up => conditions.push("h.status = 'up'".to_string()),
            HostFilter::Down => conditions.push("(h.status = 'down' OR h.status = '')".to_string()),
            HostFilter::Vulnerable => conditions.push(
                "EXISTS (SELECT 1 FROM vulnerabilities v WHERE v.host_id = h.id)".to_string(),
            ),
        }

        let search = search.trim();
        if !search.is_empty() {
            conditions
                .push("(h.ip_address LIKE ? OR h.mac_address LIKE ? OR h.vendor LIKE ?)".to_string());
            let term = format!("%{}%", search);
            for _ in 0..3 {
                args.push(term.clone().into());
            }
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.connection().lock();
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM hosts h WHERE {}", where_clause),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )
            .with_context(|| format!("count hosts for campaign {}", campaign_id))?;

        let mut page_args = args.clone();
        page_args.push((self.page_limit(limit) as i64).into());
        page_args.push((offset as i64).into());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM hosts h WHERE {} ORDER BY h.ip_address DESC, h.id DESC LIMIT ? OFFSET ?",
                HOST_COLUMNS, where_clause
            ))
            .context("prepare host page")?;
        let rows = stmt
            .query_map(params_from_iter(page_args.iter()), host_row)
            .with_context(|| format!("page hosts for campaign {}", campaign_id))?
            .collect::<Result<Vec<_>, _>>()
            .context("read host row")?;
        Ok((rows, total))
    }

    pub fn get_host(&self, host_id: i64, campaign_id: i64) -> Result<Host, StoreError> {
        let conn = self.connection().lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM hosts h WHERE h.id = ?1 AND h.campaign_id = ?2", HOST_COLUMNS),
                params![host_id, campaign_id],
                host_row,
            )
            .optional()
            .with_context(|| format!("query host {}", host_id))?
            .ok_or_else(|| {
                StoreError::NotFound(format!("host {} in campaign {}", host_id, campaign_id))
            })?;

        let clues: String = conn
            .query_row(
                "SELECT behavioral_clues FROM hosts WHERE id = ?1",
                params![host_id],
                |r| r.get(0),
            )
            .with_context(|| format!("query clues of host {}", host_id))?;
        let mut host = host_from_row(&row);
        host.fingerprint.set_clues_from_joined(&clues);
        load_host_details(&conn, &mut host, true)?;
        Ok(host)
    }

    /// Every host of the campaign with ports, findings, communications and DNS lookups.
    pub fn get_full_hosts_for_campaign(&self, campaign_id: i64) -> Result<Vec<Host>, StoreError> {
        let conn = self.connection().lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM hosts h WHERE h.campaign_id = ?1 ORDER BY h.ip_address, h.id",
                HOST_COLUMNS
            ))
            .context("prepare campaign hosts")?;
        let rows = stmt
            .query_map(params![campaign_id], host_row)
            .with_context(|| format!("list hosts of campaign {}", campaign_id))?
            .collect::<Result<Vec<_>, _>>()
            .context("read host row")?;

        let mut hosts = Vec::with_capacity(rows.len());
        for row in rows {
            let mut host = host_from_row(&row);
            load_host_details(&conn, &mut host, false)?;
            hosts.push(host);
        }
        Ok(hosts)
    }

    pub fn get_dashboard_summary(&self, campaign_id: i64) -> Result<DashboardSummary, StoreError> {
        let conn = self.connection().lock();
        let mut summary = DashboardSummary {
            total_hosts: count(&conn, "SELECT COUNT(*) FROM hosts WHERE campaign_id = ?1", campaign_id)?,
            hosts_up: count(
                &conn,
                "SELECT COUNT(*) FROM hosts WHERE campaign_id = ?1 AND status = 'up'",
                campaign_id,
            )?,
            handshakes: count(&conn, "SELECT COUNT(*) FROM handshakes WHERE campaign_id = ?1", campaign_id)?,
            credentials: count(&conn, "SELECT COUNT(*) FROM credentials WHERE campaign_id = ?1", campaign_id)?,
            ..Default::default()
        };
        summary.hosts_down = summary.total_hosts - summary.hosts_up;

        let mut stmt = conn
            .prepare(
                "SELECT p.port_number FROM ports p JOIN hosts h ON p.host_id = h.id
                 WHERE h.campaign_id = ?1 AND p.state = 'open'
                 GROUP BY p.port_number ORDER BY COUNT(*) DESC, p.port_number ASC LIMIT 5",
            )
            .context("prepare common ports")?;
        summary.most_common_ports = stmt
            .query_map(params![campaign_id], |row| row.get::<_, u16>(0))
            .with_context(|| format!("common ports for campaign {}", campaign_id))?
            .collect::<Result<Vec<u16>, _>>()
            .context("read common port")?;

        let mut stmt = conn
            .prepare(
                "SELECT v.category, COUNT(*) FROM vulnerabilities v JOIN hosts h ON v.host_id = h.id
                 WHERE h.campaign_id = ?1 GROUP BY v.category",
            )
            .context("prepare finding counts")?;
        let per_category = stmt
            .query_map(params![campaign_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .with_context(|| format!("finding counts for campaign {}", campaign_id))?
            .collect::<Result<Vec<_>, _>>()
            .context("read finding count")?;
        for (category, n) in per_category {
            match FindingCategory::from_str(&category) {
                Ok(FindingCategory::Critical) => summary.critical_findings += n,
                Ok(FindingCategory::Potential) => summary.potential_findings += n,
                Ok(FindingCategory::Informational) => summary.informational_findings += n,
                Err(_) => {}
            }
        }
        summary.total_findings =
            summary.critical_findings + summary.potential_findings + summary.informational_findings;
        Ok(summary)
    }

    pub fn get_handshakes_paginated(
        &self,
        campaign_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HandshakeRow>, StoreError> {
        let limit = self.page_limit(limit);
        let conn = self.connection().lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, ap_mac, client_mac, ssid, state, pcap_file, key_data FROM handshakes
                 WHERE campaign_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            )
            .context("prepare handshake page")?;
        let rows = stmt
            .query_map(params![campaign_id, limit, offset], |row| {
                let key_data: Vec<u8> = row.get(6)?;
                Ok(HandshakeRow {
                    id: row.get(0)?,
                    ap_mac: row.get(1)?,
                    client_mac: row.get(2)?,
                    ssid: row.get(3)?,
                    state: row.get(4)?,
                    pcap_file: row.get(5)?,
                    key_data_hex: hex::encode(key_data),
                })
            })
            .with_context(|| format!("page handshakes for campaign {}", campaign_id))?
            .collect::<Result<Vec<_>, _>>()
            .context("read handshake row")?;
        Ok(rows)
    }

    pub fn count_handshakes(&self, campaign_id: i64) -> Result<i64, StoreError> {
        count(
            &self.connection().lock(),
            "SELECT COUNT(*) FROM handshakes WHERE campaign_id = ?1",
            campaign_id,
        )
    }

    /// Newest first.
    pub fn get_credentials(&self, campaign_id: i64) -> Result<Vec<Credential>, StoreError> {
        let conn = self.connection().lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, h.mac_address, c.endpoint, c.type, c.value, c.pcap_file, c.campaign_id
                 FROM credentials c JOIN hosts h ON c.host_id = h.id
                 WHERE c.campaign_id = ?1 ORDER BY c.id DESC",
            )
            .context("prepare credentials")?;
        let rows = stmt
            .query_map(params![campaign_id], |row| {
                Ok(Credential {
                    id: row.get(0)?,
                    host_mac: row.get(1)?,
                    endpoint: row.get(2)?,
                    credential_type: row.get(3)?,
                    value: row.get(4)?,
                    pcap_file: row.get(5)?,
                    campaign_id: row.get(6)?,
                })
            })
            .with_context(|| format!("list credentials for campaign {}", campaign_id))?
            .collect::<Result<Vec<_>, _>>()
            .context("read credential row")?;
        Ok(rows)
    }

    pub fn count_credentials(&self, campaign_id: i64) -> Result<i64, StoreError> {
        count(
            &self.connection().lock(),
            "SELECT COUNT(*) FROM credentials WHERE campaign_id = ?1",
            campaign_id,
        )
    }

    pub fn get_screenshot(&self, screenshot_id: i64) -> Result<Vec<u8>, StoreError> {
        self.connection()
            .lock()
            .query_row(
                "SELECT image_data FROM screenshots WHERE id = ?1",
                params![screenshot_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("query screenshot {}", screenshot_id))?
            .ok_or_else(|| StoreError::NotFound(format!("screenshot {}", screenshot_id)))
    }

    /// Everything recorded under a campaign, for report rendering. Hosts and
    /// handshakes are each capped at the configured export limit.
    pub fn export_campaign(&self, campaign_id: i64, limit: u32) -> Result<CampaignExport, StoreError> {
        let limit = self.export_limit(limit);
        let campaign = self.get_campaign(campaign_id)?;
        let mut hosts = self.get_full_hosts_for_campaign(campaign_id)?;
        hosts.truncate(limit as usize);
        Ok(CampaignExport {
            campaign,
            hosts,
            handshakes: self.get_handshakes_paginated(campaign_id, limit, 0)?,
            credentials: self.get_credentials(campaign_id)?,
        })
    }
}

fn host_from_row(row: &HostRow) -> Host {
    let mut host = Host::new(&row.mac_address);
    host.id = row.id;
    host.add_ip(&row.ip_address);
    host.status = HostStatus::parse(&row.status);
    host.discovered_by = row.discovered_by.clone();
    host.fingerprint.vendor = row.vendor.clone();
    host.fingerprint.operating_system = row.os_guess.clone();
    host.fingerprint.device_type = row.device_type.clone();
    host
}

// Ports, findings, communications, DNS and optionally the probe results of one host
fn load_host_details(conn: &Connection, host: &mut Host, with_probes: bool) -> Result<(), StoreError> {
    let host_id = host.id;

    let mut port_numbers: HashMap<i64, u16> = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT id, port_number, protocol, state, service, version FROM ports WHERE host_id = ?1 ORDER BY port_number")
        .context("prepare host ports")?;
    let ports = stmt
        .query_map(params![host_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                Port {
                    number: row.get(1)?,
                    protocol: row.get(2)?,
                    state: row.get(3)?,
                    service: row.get(4)?,
                    version: row.get(5)?,
                },
            ))
        })
        .with_context(|| format!("query ports of host {}", host_id))?
        .collect::<Result<Vec<_>, _>>()
        .context("read port row")?;
    for (port_id, port) in ports {
        port_numbers.insert(port_id, port.number);
        host.add_port(port);
    }

    let mut stmt = conn
        .prepare("SELECT port_id, cve, description, state, category FROM vulnerabilities WHERE host_id = ?1 ORDER BY id")
        .context("prepare host findings")?;
    let findings = stmt
        .query_map(params![host_id], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .with_context(|| format!("query findings of host {}", host_id))?
        .collect::<Result<Vec<_>, _>>()
        .context("read finding row")?;
    for (port_id, cve, description, state, category) in findings {
        let Ok(category) = FindingCategory::from_str(&category) else {
            continue;
        };
        host.findings.entry(category).or_default().push(Vulnerability {
            cve,
            description,
            state,
            category,
            port: port_id.and_then(|id| port_numbers.get(&id).copied()),
        });
    }

    let mut stmt = conn
        .prepare("SELECT counterpart_ip, packet_count, geo_country, geo_city, geo_isp FROM communications WHERE host_id = ?1 ORDER BY id")
        .context("prepare host communications")?;
    let comms = stmt
        .query_map(params![host_id], |row| {
            let country: Option<String> = row.get(2)?;
            let city: Option<String> = row.get(3)?;
            let isp: Option<String> = row.get(4)?;
            let geo = if country.is_some() || city.is_some() || isp.is_some() {
                Some(GeoInfo {
                    country: country.unwrap_or_default(),
                    city: city.unwrap_or_default(),
                    isp: isp.unwrap_or_default(),
                })
            } else {
                None
            };
            Ok(Communication {
                counterpart_ip: row.get(0)?,
                packet_count: row.get::<_, i64>(1)?.max(0) as u64,
                geo,
            })
        })
        .with_context(|| format!("query communications of host {}", host_id))?
        .collect::<Result<Vec<_>, _>>()
        .context("read communication row")?;
    for comm in comms {
        // Later sessions add rows for the same counterpart; the newest one wins
        host.communications.insert(comm.counterpart_ip.clone(), comm);
    }

    let mut stmt = conn
        .prepare("SELECT domain FROM dns_lookups WHERE host_id = ?1")
        .context("prepare host DNS lookups")?;
    host.dns_lookups = stmt
        .query_map(params![host_id], |row| row.get::<_, String>(0))
        .with_context(|| format!("query DNS lookups of host {}", host_id))?
        .collect::<Result<_, _>>()
        .context("read DNS row")?;

    if with_probes {
        load_probe_results(conn, host)?;
    }
    Ok(())
}

fn load_probe_results(conn: &Connection, host: &mut Host) -> Result<(), StoreError> {
    let host_id = host.id;

    let mut stmt = conn
        .prepare(
            "SELECT w.id, p.port_number, w.method, w.status_code, w.headers
             FROM web_responses w JOIN ports p ON w.port_id = p.id WHERE w.host_id = ?1 ORDER BY w.id",
        )
        .context("prepare web responses")?;
    let web = stmt
        .query_map(params![host_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, u16>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u16>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .with_context(|| format!("query web responses of host {}", host_id))?
        .collect::<Result<Vec<_>, _>>()
        .context("read web response row")?;
    for (id, port, method, status_code, headers) in web {
        host.web_responses.push(WebResponse {
            id,
            port,
            method,
            status_code,
            headers: serde_json::from_str(&headers)?,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, p.port_number, s.image_data, s.capture_time
             FROM screenshots s JOIN ports p ON s.port_id = p.id WHERE s.host_id = ?1 ORDER BY s.id",
        )
        .context("prepare screenshots")?;
    host.screenshots = stmt
        .query_map(params![host_id], |row| {
            let capture_time: String = row.get(3)?;
            Ok(Screenshot {
                id: row.get(0)?,
                port: row.get(1)?,
                image_data: row.get(2)?,
                capture_time: parse_timestamp(&capture_time),
            })
        })
        .with_context(|| format!("query screenshots of host {}", host_id))?
        .collect::<Result<_, _>>()
        .context("read screenshot row")?;

    let mut stmt = conn
        .prepare(
            "SELECT f.id, p.port_number, f.address, f.status, f.error, f.anonymous_login_possible, f.current_dir, f.directory_listing
             FROM ftp_results f JOIN ports p ON f.port_id = p.id WHERE f.host_id = ?1 ORDER BY f.id",
        )
        .context("prepare ftp results")?;
    host.ftp_results = stmt
        .query_map(params![host_id], |row| {
            let listing: String = row.get(7)?;
            Ok(FtpResult {
                id: row.get(0)?,
                port: row.get(1)?,
                address: row.get(2)?,
                status: row.get(3)?,
                error: row.get(4)?,
                anonymous_login_possible: row.get(5)?,
                current_dir: row.get(6)?,
                directory_listing: split_lines(&listing),
            })
        })
        .with_context(|| format!("query ftp results of host {}", host_id))?
        .collect::<Result<_, _>>()
        .context("read ftp row")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, p.port_number, s.address, s.user, s.status, s.error, s.successful, s.output
             FROM ssh_results s JOIN ports p ON s.port_id = p.id WHERE s.host_id = ?1 ORDER BY s.id",
        )
        .context("prepare ssh results")?;
    host.ssh_results = stmt
        .query_map(params![host_id], |row| {
            Ok(SshResult {
                id: row.get(0)?,
                port: row.get(1)?,
                address: row.get(2)?,
                user: row.get(3)?,
                status: row.get(4)?,
                error: row.get(5)?,
                successful: row.get(6)?,
                output: row.get(7)?,
            })
        })
        .with_context(|| format!("query ssh results of host {}", host_id))?
        .collect::<Result<_, _>>()
        .context("read ssh row")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, p.port_number, s.address, s.status, s.error, s.successful, s.shares
             FROM smb_results s JOIN ports p ON s.port_id = p.id WHERE s.host_id = ?1 ORDER BY s.id",
        )
        .context("prepare smb results")?;
    host.smb_results = stmt
        .query_map(params![host_id], |row| {
            let shares: String = row.get(6)?;
            Ok(SmbResult {
                id: row.get(0)?,
                port: row.get(1)?,
                address: row.get(2)?,
                status: row.get(3)?,
                error: row.get(4)?,
                successful: row.get(5)?,
                shares: split_lines(&shares),
            })
        })
        .with_context(|| format!("query smb results of host {}", host_id))?
        .collect::<Result<_, _>>()
        .context("read smb row")?;
    Ok(())
}

fn split_lines(joined: &str) -> Vec<String> {
    joined
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}
