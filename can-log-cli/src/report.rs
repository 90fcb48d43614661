//! Report generation
//!
//! Renders a finished analysis session as a plain-text report or as JSON.

use anyhow::Result;
use can_log_analyzer::{
    AnalysisKind, AnalysisSession, FileReport, FileStatus, FrequencyClass, PatternSummary, Timeline, TimelineEvent, ZoomBucket,
};
use std::io::Write;

const RULE: &str = "═══════════════════════════════════════════════";
const THIN_RULE: &str = "───────────────────────────────────────────────";

/// Write the session as pretty-printed JSON
pub fn write_json<W: Write + ?Sized>(session: &AnalysisSession, out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, session)?;
    writeln!(out)?;
    Ok(())
}

/// Write the human-readable report, listing at most `max_errors` events
pub fn write_text<W: Write + ?Sized>(session: &AnalysisSession, out: &mut W, max_errors: usize) -> Result<()> {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "  CAN Log Analysis Report")?;
    writeln!(out, "{}", RULE)?;
    writeln!(out, "Created:  {}", session.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    let analyses: Vec<&str> = session.analyses.iter().map(|a| a.as_str()).collect();
    writeln!(out, "Analyses: {}", analyses.join(", "))?;
    if let Some((name, stats)) = &session.dbc {
        writeln!(
            out,
            "DBC:      {} ({} messages, {} signals, {} multiplexed)",
            name, stats.num_messages, stats.num_signals, stats.num_multiplexed
        )?;
    }

    writeln!(out, "\n📄 Files")?;
    writeln!(out, "{}", THIN_RULE)?;
    for file in &session.files {
        write_file(out, file)?;
    }

    if session.analyses.contains(&AnalysisKind::Errors) || session.analyses.contains(&AnalysisKind::Correlation) {
        write_errors(out, session, max_errors)?;
    }
    if !session.clusters.is_empty() {
        write_clusters(out, session)?;
    }
    if let Some(patterns) = &session.patterns {
        write_patterns(out, patterns)?;
    }
    if !session.signals.is_empty() {
        writeln!(out, "\n📈 Signals")?;
        writeln!(out, "{}", THIN_RULE)?;
        for signal in &session.signals {
            let unit = signal.unit.as_deref().unwrap_or("");
            write!(
                out,
                "  {:<32} {:>8} samples  min {:.3} max {:.3} last {:.3} {}",
                signal.name, signal.samples, signal.min, signal.max, signal.last, unit
            )?;
            if signal.out_of_range > 0 {
                write!(out, "  [{} out of range]", signal.out_of_range)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_file<W: Write + ?Sized>(out: &mut W, file: &FileReport) -> Result<()> {
    write!(out, "  [{}] {} ({})", file.file_id, file.name, file.detected_format)?;
    match &file.status {
        FileStatus::Completed => writeln!(out)?,
        FileStatus::Unsupported { reason } => {
            writeln!(out, "  UNSUPPORTED: {}", reason)?;
            return Ok(());
        }
        FileStatus::Failed { reason, location } => {
            match location {
                Some(location) => writeln!(out, "  FAILED at {}: {}", location, reason)?,
                None => writeln!(out, "  FAILED: {}", reason)?,
            }
            return Ok(());
        }
    }
    if !file.detected_format.is_log() {
        return Ok(());
    }

    let channels: Vec<String> = file.channels.iter().map(|c| c.to_string()).collect();
    writeln!(
        out,
        "      messages {}  unique IDs {} ({} extended)  channels [{}]",
        file.total_messages,
        file.unique_ids,
        file.extended_ids,
        channels.join(", ")
    )?;
    if let Some((start, end)) = file.time_range {
        writeln!(out, "      time {:.6} .. {:.6} s", start, end)?;
    }
    writeln!(
        out,
        "      error events {}  error frames {}  skipped records {}",
        file.error_count, file.error_frames, file.skipped_records
    )?;
    if let (Some(at), Some(reason)) = (&file.parse_stats.first_skipped, &file.parse_stats.first_skipped_reason) {
        writeln!(out, "      first skipped record at {}: {}", at, reason)?;
    }
    if file.signal_anomalies > 0 {
        writeln!(out, "      out-of-range signal values {}", file.signal_anomalies)?;
    }
    Ok(())
}

fn write_errors<W: Write + ?Sized>(out: &mut W, session: &AnalysisSession, max_errors: usize) -> Result<()> {
    let summary = &session.error_summary;
    writeln!(out, "\n⚠️  Errors: {}", summary.total)?;
    writeln!(out, "{}", THIN_RULE)?;
    if summary.total == 0 {
        return Ok(());
    }
    for (severity, count) in summary.by_severity.iter().rev() {
        writeln!(out, "  {:<10} {}", severity.to_string(), count)?;
    }
    for (error_type, count) in &summary.by_type {
        writeln!(out, "  {:<22} {}", error_type.as_str(), count)?;
    }
    writeln!(out)?;

    for event in session.errors.iter().take(max_errors) {
        let bus_id = event.bus_id.map(|id| format!("0x{:X}", id)).unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "  #{:<5} {:>12.6}  {:<8} {:<22} ch{} {:<11} {}",
            event.id,
            event.timestamp,
            event.severity.to_string(),
            event.error_type.as_str(),
            event.channel,
            bus_id,
            event.description
        )?;
    }
    if session.errors.len() > max_errors {
        writeln!(out, "  ... {} more", session.errors.len() - max_errors)?;
    }

    writeln!(out, "\n  Suggested fixes:")?;
    for error_type in summary.by_type.keys() {
        writeln!(out, "  {:<22} {}", error_type.as_str(), error_type.fix_suggestion())?;
    }
    Ok(())
}

fn write_clusters<W: Write + ?Sized>(out: &mut W, session: &AnalysisSession) -> Result<()> {
    writeln!(out, "\n🔗 Incidents: {}", session.clusters.len())?;
    writeln!(out, "{}", THIN_RULE)?;
    for cluster in &session.clusters {
        writeln!(
            out,
            "  Incident {}: {} event(s), {:.6} .. {:.6} s, max {}, linked by {:?}",
            cluster.id,
            cluster.event_ids.len(),
            cluster.start,
            cluster.end,
            cluster.max_severity,
            cluster.affinity
        )?;
        if let Some(root) = session.error(cluster.root_candidate) {
            writeln!(out, "      likely origin: {} {}", root.code, root.description)?;
        }
    }
    Ok(())
}

fn write_patterns<W: Write + ?Sized>(out: &mut W, patterns: &PatternSummary) -> Result<()> {
    writeln!(out, "\n📊 Traffic")?;
    writeln!(out, "{}", THIN_RULE)?;
    writeln!(
        out,
        "  messages {}  unique IDs {}  duration {:.3} s  rate {:.1} msg/s",
        patterns.total_messages, patterns.unique_ids, patterns.duration, patterns.messages_per_second
    )?;
    writeln!(
        out,
        "  CAN bus load {:.2}%  LIN bus load {:.2}%  error frames {}",
        patterns.bus_load_percent, patterns.lin_bus_load_percent, patterns.error_frames
    )?;
    if patterns.channel_loads.len() > 1 {
        let loads: Vec<String> = patterns
            .channel_loads
            .iter()
            .map(|(channel, load)| format!("ch{} {:.2}%", channel, load))
            .collect();
        writeln!(out, "  per channel: {}", loads.join("  "))?;
    }
    writeln!(out, "  periodic IDs {}  irregular IDs {}", patterns.normal_ids, patterns.irregular_ids)?;

    if !patterns.dominant_ids.is_empty() {
        writeln!(out, "\n  Busiest IDs:")?;
        for dominant in &patterns.dominant_ids {
            writeln!(
                out,
                "    0x{:<8X} {:>10}  {:>5.1}%",
                dominant.id,
                dominant.count,
                dominant.share * 100.0
            )?;
        }
    }

    let irregular: Vec<_> = patterns
        .ids
        .iter()
        .filter(|s| s.classification == FrequencyClass::Irregular && s.count > 2)
        .collect();
    if !irregular.is_empty() {
        writeln!(out, "\n  Irregular IDs:")?;
        for stats in irregular {
            let cv = stats
                .coefficient_of_variation
                .map(|cv| format!("{:.2}", cv))
                .unwrap_or_else(|| "-".to_string());
            writeln!(out, "    0x{:<8X} {:>10} msgs  cv {}", stats.id, stats.count, cv)?;
        }
    }
    Ok(())
}

/// Print the down-sampled view of `[t0, t1]`
pub fn write_zoom<W: Write + ?Sized>(out: &mut W, buckets: &[ZoomBucket]) -> Result<()> {
    let peak = buckets.iter().map(|b| b.message_count).max().unwrap_or(0).max(1);
    for bucket in buckets {
        let bar = "█".repeat(bucket.message_count * 40 / peak);
        let severity = bucket.max_severity.map(|s| s.to_string()).unwrap_or_default();
        writeln!(
            out,
            "{:>12.6} {:>8} msgs {:>4} err {:<8} {}",
            bucket.start, bucket.message_count, bucket.error_count, severity, bar
        )?;
    }
    Ok(())
}

/// List every timeline entry in `[t0, t1]`
pub fn write_events<W: Write + ?Sized>(out: &mut W, timeline: &Timeline, t0: f64, t1: f64) -> Result<()> {
    for event in timeline.events_between(t0, t1) {
        match event {
            TimelineEvent::Message(message) => {
                if let Some(text) = message.text.as_deref() {
                    writeln!(out, "{:>12.6}  [{}] {}", message.timestamp, message.reference.file_id, text)?;
                    continue;
                }
                let flags = if message.is_bus_off {
                    " BUS-OFF"
                } else if message.is_error_frame {
                    " ERROR"
                } else {
                    ""
                };
                writeln!(
                    out,
                    "{:>12.6}  [{}] ch{} 0x{:<8X} [{}] #{}{}",
                    message.timestamp,
                    message.reference.file_id,
                    message.channel,
                    message.id,
                    message.dlc,
                    message.reference.seq,
                    flags
                )?;
            }
            TimelineEvent::Error(error) => {
                writeln!(
                    out,
                    "{:>12.6}  !! {} {} {}",
                    error.timestamp, error.severity, error.error_type, error.description
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_log_analyzer::{AnalysisConfig, AnalysisRequest, Analyzer, CancelToken, NoProgress, RawFile};

    const ASC: &str = "date Mon Jan 1 10:00:00 2024\n\
base hex  timestamps absolute\n\
   0.000000 1  100             Rx   d 2 01 02\n\
   0.100000 1  100             Rx   d 2 01 02\n\
   0.200000 1  100             Rx   d 2 01 02\n\
   0.600000 1  100             Rx   d 2 01 02\n\
   0.650000 1  ErrorFrame\n";

    fn session() -> AnalysisSession {
        let analyzer = Analyzer::new(AnalysisConfig::default()).unwrap();
        let request = AnalysisRequest::new(vec![
            RawFile::from_bytes("trace.asc", ASC),
            RawFile::from_bytes("junk.bin", vec![0u8, 0xFF, 0x10]),
        ]);
        analyzer.run(&request, &NoProgress, &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_text_report_sections() {
        let mut out = Vec::new();
        write_text(&session(), &mut out, 1).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("trace.asc (CAN_ASC)"));
        assert!(text.contains("junk.bin (UNKNOWN)  UNSUPPORTED"));
        assert!(text.contains("Errors: 2"));
        assert!(text.contains("TIMEOUT"));
        assert!(text.contains("... 1 more"));
        assert!(text.contains("CAN bus load"));
    }

    #[test]
    fn test_json_report_round_trips_counts() {
        let mut out = Vec::new();
        write_json(&session(), &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value["files"].as_array().unwrap().len(), 2);
        assert_eq!(value["files"][1]["status"]["status"], "unsupported");
        assert_eq!(value["errors"][0]["error_type"], "TIMEOUT");
        assert_eq!(value["error_summary"]["total"], 2);
        assert!(value.get("timeline").is_none());
    }

    #[test]
    fn test_timeline_output() {
        let session = session();
        let timeline = session.timeline.as_ref().unwrap();

        let mut out = Vec::new();
        write_events(&mut out, timeline, 0.3, 0.7).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("TIMEOUT"));
        assert!(lines[3].contains("ERROR_FRAME"));

        let mut out = Vec::new();
        write_zoom(&mut out, &timeline.zoom(0.0, 0.7, Some(7))).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 7);
    }
}
