use std::time::{Duration, Instant};

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, error, info, warn};

use crate::client::{ControlClient, PingMonitor};
use crate::config::JobContext;
use crate::error::{BulwarkError, Result};

/// Overall window for legacy clients that rebuild their filelist without
/// progress packets.
pub const FULL_BACKUP_CONSTRUCT_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
/// Overall window for protocol v2+ clients (they send BUSY keepalives).
pub const CONSTRUCT_TIMEOUT_V2: Duration = Duration::from_secs(120);
/// Single framed read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Silence window after which a legacy client is retried without a token.
pub const LEGACY_RETRY_WINDOW: Duration = Duration::from_secs(20);

const WITH_FLAGS: &str =
    "&with_permissions=1&with_scripts=1&with_orig_path=1&with_sequence=1&with_proper_symlinks=1";

#[derive(Debug, Clone)]
pub struct FilelistRequest {
    pub full: bool,
    pub resume: bool,
    pub group: i32,
    pub clientsubname: String,
    pub with_token: bool,
}

/// Build the `START BACKUP` command line for the client, honoring its
/// advertised protocol tuple.
pub fn build_start_command(ctx: &JobContext, req: &FilelistRequest) -> String {
    let mut pver = "";
    if ctx.protocol.file_protocol_version >= 2 {
        pver = "2";
    }
    if ctx.protocol.file_protocol_version_v2 >= 1 {
        pver = "3";
    }

    let mut cmd = format!("{}{pver}", ctx.identity());

    if req.full && !req.resume {
        cmd.push_str("START FULL BACKUP");
    } else {
        cmd.push_str("START BACKUP");
    }

    if ctx.protocol.file_protocol_version_v2 >= 1 {
        cmd.push_str(&format!(" group={}", req.group));
        if !req.clientsubname.is_empty() {
            cmd.push_str(&format!(
                "&clientsubname={}",
                utf8_percent_encode(&req.clientsubname, NON_ALPHANUMERIC)
            ));
        }
    }

    if req.resume && ctx.protocol.file_protocol_version_v2 >= 1 {
        cmd.push_str("&resume=");
        cmd.push_str(if req.full { "full" } else { "incr" });
    }

    if ctx.protocol.select_sha_version > 0 {
        cmd.push_str("&sha=512");
    }

    cmd.push_str(WITH_FLAGS);

    if req.with_token {
        cmd.push_str(&format!("#token={}", ctx.server_token));
    }

    cmd
}

/// Ask the client to hash every transferred file for end-to-end checking.
pub fn enable_end_to_end_verification(control: &dyn ControlClient) -> Result<()> {
    let reply = control.send_message(
        "ENABLE END TO END FILE BACKUP VERIFICATION",
        Duration::from_secs(10),
    )?;
    if reply != "OK" {
        return Err(BulwarkError::Other(
            "enabling end to end file backup verification on client failed".into(),
        ));
    }
    Ok(())
}

/// Timeout knobs for the negotiation, defaulting per protocol version.
/// Tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    pub overall: Duration,
    pub read: Duration,
    pub legacy_retry_window: Duration,
}

impl NegotiationTimeouts {
    pub fn for_protocol(ctx: &JobContext) -> Self {
        let overall = if ctx.protocol.file_protocol_version >= 2 {
            CONSTRUCT_TIMEOUT_V2
        } else {
            FULL_BACKUP_CONSTRUCT_TIMEOUT
        };
        NegotiationTimeouts {
            overall,
            read: READ_TIMEOUT,
            legacy_retry_window: LEGACY_RETRY_WINDOW,
        }
    }
}

/// Drive the filelist construction handshake: connect, send the start
/// command, then read packets until `DONE`. `BUSY` resets the timeout
/// clock; `no backup dirs` and any other text are remote failures. A
/// silent legacy client is retried once without the token.
pub fn request_filelist_construct(
    ctx: &JobContext,
    client_name: &str,
    control: &dyn ControlClient,
    ping: &dyn PingMonitor,
    req: &FilelistRequest,
    timeouts: NegotiationTimeouts,
) -> Result<()> {
    let mut req = req.clone();
    loop {
        match negotiate_once(ctx, client_name, control, ping, &req, timeouts)? {
            Outcome::Done => return Ok(()),
            Outcome::RetryWithoutToken => {
                // Old clients drop unknown token suffixes on the floor.
                warn!(client = client_name, "trying old filelist request without token");
                req.with_token = false;
            }
        }
    }
}

enum Outcome {
    Done,
    RetryWithoutToken,
}

fn negotiate_once(
    ctx: &JobContext,
    client_name: &str,
    control: &dyn ControlClient,
    ping: &dyn PingMonitor,
    req: &FilelistRequest,
    timeouts: NegotiationTimeouts,
) -> Result<Outcome> {
    debug!(client = client_name, "connecting for filelist");
    let mut conn = control
        .connect_control(Duration::from_secs(10))
        .map_err(|e| {
            error!(client = client_name, error = %e,
                "CONNECT error during filelist construction");
            BulwarkError::ConnectFail(client_name.to_string())
        })?;

    conn.send(&build_start_command(ctx, req))?;
    debug!(client = client_name, "waiting for filelist");

    let negotiation_start = Instant::now();
    let mut window_start = Instant::now();

    loop {
        if window_start.elapsed() > timeouts.overall {
            error!(client = client_name, "filelist construction failed - TIMEOUT(1)");
            return Err(BulwarkError::FilelistTimeout);
        }

        let packet = conn
            .read_packet(timeouts.read)
            .map_err(|e| BulwarkError::FilelistRemoteError(e.to_string()))?;

        match packet.as_deref() {
            None => {
                // No bytes within the read window.
                if ctx.protocol.file_protocol_version < 2
                    && negotiation_start.elapsed() <= timeouts.legacy_retry_window
                    && req.with_token
                {
                    return Ok(Outcome::RetryWithoutToken);
                }
                if ctx.protocol.file_protocol_version >= 2 || ping.is_timeout() {
                    error!(client = client_name, "filelist construction failed - TIMEOUT(1)");
                    return Err(BulwarkError::FilelistTimeout);
                }
                // Legacy client, still pinging: keep waiting.
            }
            Some("DONE") => {
                log_vss_logdata(control, negotiation_start.elapsed().as_secs() as i64);
                return Ok(Outcome::Done);
            }
            Some("BUSY") => {
                window_start = Instant::now();
            }
            Some("no backup dirs") => {
                error!(
                    client = client_name,
                    "filelist construction failed: no backup dirs. Please add paths to \
                     backup on the client or configure default paths to backup."
                );
                return Err(BulwarkError::NoBackupDirs);
            }
            Some(other) => {
                log_vss_logdata(control, negotiation_start.elapsed().as_secs() as i64);
                error!(client = client_name, reply = other, "filelist construction failed");
                return Err(BulwarkError::FilelistRemoteError(other.to_string()));
            }
        }
    }
}

/// One parsed client-side VSS log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VssLogLine {
    pub level: i32,
    /// Seconds before the reference timestamp; clamped to 0 when
    /// implausible.
    pub offset_s: i64,
    pub msg: String,
}

/// Parse `<loglevel>-<unix_seconds>-<msg>` lines. The first stamped line
/// sets the reference time and is consumed; later stamps become offsets
/// `reference - t`, clamped to 0 beyond `vss_duration_s + 60`.
pub fn parse_vss_log(data: &str, now_s: i64, vss_duration_s: i64) -> Vec<VssLogLine> {
    let mut out = Vec::new();
    let mut initial_time = now_s;
    let mut first_stamped = true;

    for line in data.split('\n') {
        let Some(s1) = line.find('-') else { continue };
        let level: i32 = line[..s1].parse().unwrap_or(0);

        let rest = &line[s1 + 1..];
        if let Some(s2) = rest.find('-') {
            let stamp: i64 = rest[..s2].parse().unwrap_or(0);
            if first_stamped {
                initial_time = stamp;
                first_stamped = false;
                continue;
            }
            let mut offset = initial_time - stamp;
            if offset > vss_duration_s + 60 {
                offset = 0;
            }
            out.push(VssLogLine {
                level,
                offset_s: offset,
                msg: rest[s2 + 1..].to_string(),
            });
        } else {
            out.push(VssLogLine {
                level,
                offset_s: 0,
                msg: rest.to_string(),
            });
        }
    }

    out
}

/// Fetch the client's shadow-copy log and replay it into the server log.
pub fn log_vss_logdata(control: &dyn ControlClient, vss_duration_s: i64) {
    let data = match control.send_message("GET VSSLOG", Duration::from_secs(10)) {
        Ok(data) => data,
        Err(e) => {
            info!(error = %e, "getting volume shadow copy logdata from client failed");
            return;
        }
    };
    if data.is_empty() || data == "ERR" {
        return;
    }

    let now_s = chrono::Utc::now().timestamp();
    for line in parse_vss_log(&data, now_s, vss_duration_s) {
        match line.level {
            0 => debug!(offset_s = line.offset_s, "{}", line.msg),
            1 => info!(offset_s = line.offset_s, "{}", line.msg),
            2 => warn!(offset_s = line.offset_s, "{}", line.msg),
            _ => error!(offset_s = line.offset_s, "{}", line.msg),
        }
    }
}
