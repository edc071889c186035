//! Terminal rendering of control replies.

use colored::Colorize;
use keel_net::{ConnectionError, FetchedConfig, StartOutcome};
use keel_protocol::{ClusterLine, CpuInfo, DiskInfo, MemInfo, NodeRecord};

/// A successful reply, ready for display.
#[derive(Debug)]
pub enum Output {
    Ok,
    Started(StartOutcome),
    Nodes(Vec<NodeRecord>),
    Clusters(Vec<ClusterLine>),
    Config(FetchedConfig),
    Committed { cluster_id: u32, version: u32 },
    Mem(MemInfo),
    Cpu(CpuInfo),
    Disk { dir: String, info: DiskInfo },
}

/// Strips ANSI escape sequences and other control characters from
/// server-supplied strings. Keeps tabs and newlines.
fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if let Some('[') = chars.next() {
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if ch == '\t' || ch == '\n' || !ch.is_control() {
            out.push(ch);
        }
    }
    out
}

fn label(name: &str) -> colored::ColoredString {
    format!("({name})").yellow()
}

pub fn format_output(output: &Output) -> String {
    match output {
        Output::Ok => "OK".green().to_string(),

        Output::Started(StartOutcome::Launched(pid)) => {
            format!("{} {}", label("pid"), pid.to_string().green())
        }
        Output::Started(StartOutcome::AlreadyRunning(pid)) => format!(
            "{} {} {}",
            label("pid"),
            pid.to_string().green(),
            "already running".dimmed()
        ),

        Output::Nodes(nodes) if nodes.is_empty() => "(no nodes)".dimmed().to_string(),
        Output::Nodes(nodes) => {
            let mut lines = Vec::with_capacity(nodes.len());
            for (i, node) in nodes.iter().enumerate() {
                let key = sanitize(&node.key.to_string());
                let mut line = format!("{}) {}", i + 1, key.green());
                if let Some(d) = &node.details {
                    line.push_str(&format!(
                        " pid={} program={} started={}",
                        d.pid,
                        sanitize(&d.program),
                        d.started_at
                    ));
                }
                lines.push(line);
            }
            lines.join("\n")
        }

        Output::Clusters(clusters) if clusters.is_empty() => {
            "(no clusters)".dimmed().to_string()
        }
        Output::Clusters(clusters) => clusters
            .iter()
            .map(|c| {
                format!(
                    "{} {} {}",
                    c.cluster_id.to_string().yellow(),
                    sanitize(&c.name).green(),
                    format!("v{}", c.version).dimmed()
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),

        Output::Config(cfg) => {
            let header = format!("{} cluster {} v{}", label("config"), cfg.cluster_id, cfg.version);
            let body = sanitize(&String::from_utf8_lossy(&cfg.payload));
            let body = body.strip_suffix('\n').unwrap_or(&body);
            if body.is_empty() {
                format!("{header}\n{}", "(empty)".dimmed())
            } else {
                format!("{header}\n{body}")
            }
        }

        Output::Committed {
            cluster_id,
            version,
        } => format!(
            "{} cluster {cluster_id} now at {}",
            label("committed"),
            format!("v{version}").green()
        ),

        Output::Mem(m) => format!(
            "{} total {} kB, free {} kB",
            label("mem"),
            m.total_kb.to_string().green(),
            m.free_kb.to_string().green()
        ),

        Output::Cpu(c) => format!("{} {}", label("cpus"), c.cpu_count.to_string().green()),

        Output::Disk { dir, info } => format!(
            "{} {}: total {} bytes, available {} bytes",
            label("disk"),
            sanitize(dir),
            info.total_bytes.to_string().green(),
            info.available_bytes.to_string().green()
        ),
    }
}

/// Renders a failed request. `error <msg>` replies print just the
/// server's message.
pub fn format_error(err: &ConnectionError) -> String {
    match err {
        ConnectionError::Remote(msg) => format!("{} {}", "(error)".red(), sanitize(msg).red()),
        other => format!("{} {}", "(error)".red(), other.to_string().red()),
    }
}
