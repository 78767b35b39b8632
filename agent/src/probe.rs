//! HTTP and ICMP probe execution.
//!
//! A probe never returns an `Err`: transport failures, timeouts, and
//! unparsable output all materialize as a `CheckResult` with `success =
//! false` and an explanatory `errorText`. The scheduler only ever sees data.

use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use shared::model::{CheckResult, Target, TargetKind};
use shared::utils::current_timestamp_millis;
use tokio::process::Command;

/// Runs the check appropriate to `target.kind` and returns the resulting
/// `CheckResult`, timestamped at completion.
pub async fn run_check(target: &Target, agent_id: &str, agent_name: &str) -> CheckResult {
    match target.kind {
        TargetKind::Http => run_http_check(target, agent_id, agent_name).await,
        TargetKind::Icmp => run_icmp_check(target, agent_id).await,
    }
}

async fn run_http_check(target: &Target, agent_id: &str, agent_name: &str) -> CheckResult {
    let client = reqwest::Client::new();
    let timeout = Duration::from_millis(target.timeout_ms);
    let start = Instant::now();

    let request = client
        .get(&target.endpoint)
        .header("User-Agent", format!("Storm/{agent_name}"))
        .timeout(timeout);

    let result = request.send().await;
    let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(response) => {
            let status = response.status();
            let success = status.is_success() || status.is_redirection();
            CheckResult {
                target_id: target.id,
                agent_id: agent_id.to_string(),
                timestamp: current_timestamp_millis(),
                success,
                response_time_ms: Some(response_time_ms),
                status_code: Some(status.as_u16()),
                error_text: if success {
                    None
                } else {
                    Some(format!("HTTP status {status}"))
                },
            }
        }
        Err(e) if e.is_timeout() => CheckResult {
            target_id: target.id,
            agent_id: agent_id.to_string(),
            timestamp: current_timestamp_millis(),
            success: false,
            response_time_ms: None,
            status_code: Some(408),
            error_text: Some("request timed out".to_string()),
        },
        Err(e) => CheckResult {
            target_id: target.id,
            agent_id: agent_id.to_string(),
            timestamp: current_timestamp_millis(),
            success: false,
            response_time_ms: None,
            status_code: Some(0),
            error_text: Some(e.to_string()),
        },
    }
}

async fn run_icmp_check(target: &Target, agent_id: &str) -> CheckResult {
    let start = Instant::now();
    let output = spawn_ping(&target.endpoint, target.timeout_ms).await;

    match output {
        Ok(output) => {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let success = output.status.success();
            let response_time_ms = if success {
                Some(parse_ping_rtt(&stdout).unwrap_or(elapsed_ms))
            } else {
                None
            };
            CheckResult {
                target_id: target.id,
                agent_id: agent_id.to_string(),
                timestamp: current_timestamp_millis(),
                success,
                response_time_ms,
                status_code: None,
                error_text: if success {
                    None
                } else {
                    Some(format!("ping exited with status {}", output.status))
                },
            }
        }
        Err(e) => CheckResult {
            target_id: target.id,
            agent_id: agent_id.to_string(),
            timestamp: current_timestamp_millis(),
            success: false,
            response_time_ms: None,
            status_code: None,
            error_text: Some(format!("failed to invoke ping: {e}")),
        },
    }
}

/// Shells out to the platform `ping` utility for a single echo request.
/// POSIX ping takes a whole-second timeout; Windows ping takes milliseconds.
async fn spawn_ping(host: &str, timeout_ms: u64) -> std::io::Result<std::process::Output> {
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut c = Command::new("ping");
        c.args(["-n", "1", "-w", &timeout_ms.to_string(), host]);
        c
    };

    #[cfg(not(target_os = "windows"))]
    let mut command = {
        let timeout_secs = timeout_ms.div_ceil(1000).max(1);
        let mut c = Command::new("ping");
        c.args(["-c", "1", "-W", &timeout_secs.to_string(), host]);
        c
    };

    command.stdin(Stdio::null());
    command.output().await
}

fn parse_ping_rtt(stdout: &str) -> Option<f64> {
    let re = Regex::new(r"time[=<]([0-9]+(?:\.[0-9]+)?)\s*ms").ok()?;
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_style_rtt() {
        assert_eq!(parse_ping_rtt("64 bytes from x: icmp_seq=1 time=12.3 ms"), Some(12.3));
    }

    #[test]
    fn parses_windows_style_rtt() {
        assert_eq!(parse_ping_rtt("Reply from 1.2.3.4: bytes=32 time=5ms TTL=64"), Some(5.0));
    }

    #[test]
    fn unparsable_output_returns_none() {
        assert_eq!(parse_ping_rtt("nothing useful here"), None);
    }
}
