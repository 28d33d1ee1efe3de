//! Classification of raw installer script output into progress events.
//!
//! The install script speaks no protocol: progress has to be recovered from
//! the text the download/extraction tools print. Classification is an
//! ordered cascade over each line, first match wins, and a failure to parse
//! a line is never more than a dropped or partial event.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches the verification report the downloader prints while validating a
/// finished file, e.g.
/// `[#6c27a8 1.4GiB/1.4GiB(100%) CN:0] [Checksum:#6c27a8 732MiB/1.4GiB(48%)]`
static CHECKSUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Checksum.*\s(.*)/(.*)\((\d*)%\)").unwrap());

/// A line of 40 or more spaces is keep-alive padding between progress
/// updates and carries no information.
static PADDING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ {40,}$").unwrap());

/// Installation phase reported by the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    GraphicsPatch,
    VoicePatch,
    GenericPatch,
    FinishingDownload,
    Extracting,
    MovingFolders,
    Completed,
}

/// A structured progress event recovered from one line of script output.
///
/// Percentages are always clamped to `[0, 100]`. The string fields are
/// opaque labels lifted straight from the tool output (sizes, speeds, ETAs)
/// and are meant for display, not arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    DownloadProgress {
        received: String,
        total: String,
        speed: String,
        eta: String,
        percent: f64,
    },
    VerificationProgress {
        verified: String,
        total: String,
        percent: f64,
    },
    PhaseChanged {
        phase: InstallPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PlainLine {
        text: String,
    },
}

/// Outcome of classifying one raw line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Keep-alive padding. Not an event, and not transcript material either.
    Discard,
    /// A recognized progress event.
    Event(ProgressEvent),
    /// A bracketed status line that produced no event. Verification parsing
    /// is strict by design (exactly one match, three groups) and download
    /// summaries without an ETA that also report `0B/0B` are noise, so both
    /// are dropped silently.
    Skipped,
    /// A line that looked like a download report but whose positional
    /// tokens could not be extracted. The pipeline counts these and
    /// rate-limits the log noise.
    Malformed,
}

/// True when the line is downloader keep-alive padding (40+ spaces).
pub fn is_padding(line: &str) -> bool {
    PADDING_RE.is_match(line)
}

/// Classify a single raw output line.
///
/// The cascade order mirrors what the installer script actually emits:
/// bracketed downloader telemetry first, then the phase banner lines, then
/// the extraction/move notices, and finally a plain passthrough.
pub fn classify(line: &str) -> Classification {
    if is_padding(line) {
        return Classification::Discard;
    }

    if line.starts_with('[') {
        return classify_bracketed(line);
    }

    if line.starts_with("Downloading") {
        return Classification::Event(ProgressEvent::PhaseChanged {
            phase: download_phase(line),
            detail: None,
        });
    }

    if line.contains("All done, finishing in three seconds") {
        return phase_event(InstallPhase::Completed, None);
    }

    if line.contains("Extracting files") {
        return phase_event(InstallPhase::Extracting, None);
    }

    if line.contains("Extracting archive:") {
        return phase_event(InstallPhase::Extracting, Some(line.to_string()));
    }

    if line.contains("Moving folders") {
        return phase_event(InstallPhase::MovingFolders, None);
    }

    Classification::Event(ProgressEvent::PlainLine {
        text: line.to_string(),
    })
}

fn phase_event(phase: InstallPhase, detail: Option<String>) -> Classification {
    Classification::Event(ProgressEvent::PhaseChanged { phase, detail })
}

/// Bracketed lines are downloader telemetry: checksum verification,
/// in-flight download reports, or the final no-ETA summary.
fn classify_bracketed(line: &str) -> Classification {
    if line.contains("Checksum") {
        return classify_verification(line);
    }

    if !line.contains("0B/0B") && line.contains("ETA") {
        return match parse_download(line) {
            Some(event) => Classification::Event(event),
            None => Classification::Malformed,
        };
    }

    if !line.contains("ETA") {
        return phase_event(InstallPhase::FinishingDownload, None);
    }

    Classification::Skipped
}

/// Strict verification parse: the pattern must match exactly once or the
/// line yields nothing. This is best-effort telemetry, so a mismatch is
/// silently dropped rather than degraded.
fn classify_verification(line: &str) -> Classification {
    let captures: Vec<_> = CHECKSUM_RE.captures_iter(line).collect();
    if captures.len() != 1 {
        return Classification::Skipped;
    }

    let groups = &captures[0];
    let percent: f64 = groups[3].parse().unwrap_or(0.0);
    Classification::Event(ProgressEvent::VerificationProgress {
        verified: groups[1].to_string(),
        total: groups[2].to_string(),
        percent: percent.clamp(0.0, 100.0),
    })
}

/// Positional parse of an in-flight download report, e.g.
/// `[#a1b2c3 1.4GiB/3.0GiB(47%) CN:4 DL:2.1MiB ETA:1m30s]`.
///
/// Token positions are load-bearing: token 1 is the size label, token 3 the
/// speed, the last token the ETA. The split is on single spaces so that the
/// positions line up with what the downloader prints.
fn parse_download(line: &str) -> Option<ProgressEvent> {
    let tokens: Vec<&str> = line.split(' ').collect();
    let size_label = *tokens.get(1)?;
    let speed = tokens.get(3)?.replace("DL:", "");
    let eta = tokens
        .last()?
        .replace("ETA:", "Time Remaining:")
        .replace(']', "");

    let percent: f64 = size_label
        .split('(')
        .next_back()?
        .split('%')
        .next()?
        .parse()
        .ok()?;

    // "1.4GiB/3.0GiB(47%)" -> received "1.4GiB", total "3.0GiB". A label
    // without a slash degrades to a partial event rather than no event.
    let (received, total) = match size_label.split_once('/') {
        Some((received, rest)) => {
            let total = rest.split('(').next().unwrap_or(rest);
            (received.to_string(), total.to_string())
        }
        None => (size_label.to_string(), String::new()),
    };

    Some(ProgressEvent::DownloadProgress {
        received,
        total,
        speed,
        eta,
        percent: percent.clamp(0.0, 100.0),
    })
}

fn download_phase(line: &str) -> InstallPhase {
    if line.contains("Downloading graphics patch") {
        InstallPhase::GraphicsPatch
    } else if line.contains("Downloading voice") {
        InstallPhase::VoicePatch
    } else {
        InstallPhase::GenericPatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_event(line: &str) -> ProgressEvent {
        match classify(line) {
            Classification::Event(event) => event,
            other => panic!("expected event for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn padding_lines_are_discarded() {
        let padding = " ".repeat(40);
        assert_eq!(classify(&padding), Classification::Discard);
        assert_eq!(classify(&" ".repeat(80)), Classification::Discard);
    }

    #[test]
    fn short_space_runs_are_not_padding() {
        let line = " ".repeat(39);
        assert!(matches!(
            classify(&line),
            Classification::Event(ProgressEvent::PlainLine { .. })
        ));
    }

    #[test]
    fn padding_with_trailing_text_is_not_padding() {
        let line = format!("{}x", " ".repeat(45));
        assert!(matches!(
            classify(&line),
            Classification::Event(ProgressEvent::PlainLine { .. })
        ));
    }

    #[test]
    fn verification_line_parses_strictly() {
        let line = "[#a1b2c3 1.4GiB/3.0GiB(47%) CN:4] [Checksum:#a1b2c3 732MiB/1.5GiB(48%)]";
        assert_eq!(
            expect_event(line),
            ProgressEvent::VerificationProgress {
                verified: "732MiB".to_string(),
                total: "1.5GiB".to_string(),
                percent: 48.0,
            }
        );
    }

    #[test]
    fn verification_with_empty_percent_degrades_to_zero() {
        let line = "[Checksum:#a1b2c3 732MiB/1.5GiB(%)]";
        assert_eq!(
            expect_event(line),
            ProgressEvent::VerificationProgress {
                verified: "732MiB".to_string(),
                total: "1.5GiB".to_string(),
                percent: 0.0,
            }
        );
    }

    #[test]
    fn verification_without_pattern_is_skipped() {
        assert_eq!(
            classify("[Checksum mismatch detected]"),
            Classification::Skipped
        );
    }

    #[test]
    fn download_line_parses_positionally() {
        let line = "[#a1b2c3 1.4GiB/3.0GiB(47%) CN:4 DL:2.1MiB ETA:1m30s]";
        assert_eq!(
            expect_event(line),
            ProgressEvent::DownloadProgress {
                received: "1.4GiB".to_string(),
                total: "3.0GiB".to_string(),
                speed: "2.1MiB".to_string(),
                eta: "Time Remaining:1m30s".to_string(),
                percent: 47.0,
            }
        );
    }

    #[test]
    fn download_percent_is_clamped() {
        let line = "[#a1b2c3 1.4GiB/3.0GiB(150%) CN:4 DL:2.1MiB ETA:1m30s]";
        match expect_event(line) {
            ProgressEvent::DownloadProgress { percent, .. } => assert_eq!(percent, 100.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn zero_byte_download_with_eta_is_skipped() {
        assert_eq!(
            classify("[#a1b2c3 0B/0B(0%) CN:4 DL:0B ETA:0s]"),
            Classification::Skipped
        );
    }

    #[test]
    fn bracketed_line_without_eta_is_finishing_download() {
        assert_eq!(
            classify("[#a1b2c3 1.4GiB/1.4GiB(100%) CN:0]"),
            Classification::Event(ProgressEvent::PhaseChanged {
                phase: InstallPhase::FinishingDownload,
                detail: None,
            })
        );
    }

    #[test]
    fn truncated_download_line_is_malformed() {
        assert_eq!(classify("[#a1b2c3 ETA:1m]"), Classification::Malformed);
    }

    #[test]
    fn download_line_with_garbage_percent_is_malformed() {
        let line = "[#a1b2c3 1.4GiB/3.0GiB(??%) CN:4 DL:2.1MiB ETA:1m30s]";
        assert_eq!(classify(line), Classification::Malformed);
    }

    #[test]
    fn downloading_lines_select_phases() {
        assert_eq!(
            expect_event("Downloading graphics patch files..."),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::GraphicsPatch,
                detail: None,
            }
        );
        assert_eq!(
            expect_event("Downloading voice patch files..."),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::VoicePatch,
                detail: None,
            }
        );
        assert_eq!(
            expect_event("Downloading patch files..."),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::GenericPatch,
                detail: None,
            }
        );
    }

    #[test]
    fn completion_marker_is_detected() {
        assert_eq!(
            expect_event("All done, finishing in three seconds"),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::Completed,
                detail: None,
            }
        );
    }

    #[test]
    fn extraction_markers_are_detected() {
        assert_eq!(
            expect_event("Extracting files into the game folder"),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::Extracting,
                detail: None,
            }
        );
        assert_eq!(
            expect_event("Extracting archive: graphics.7z"),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::Extracting,
                detail: Some("Extracting archive: graphics.7z".to_string()),
            }
        );
        assert_eq!(
            expect_event("Moving folders around, hang tight"),
            ProgressEvent::PhaseChanged {
                phase: InstallPhase::MovingFolders,
                detail: None,
            }
        );
    }

    #[test]
    fn unknown_lines_pass_through() {
        assert_eq!(
            expect_event("aria2 version 1.36.0"),
            ProgressEvent::PlainLine {
                text: "aria2 version 1.36.0".to_string(),
            }
        );
    }

    #[test]
    fn events_serialize_as_tagged_json() {
        let event = expect_event("Downloading voice patch files...");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_changed\""));
        assert!(json.contains("\"voice_patch\""));
    }
}
