const MIN_LINES_FOR_ANALYSIS: usize = 10;
const REPEATED_RUN_THRESHOLD: usize = 12;
const UNIQUE_RATIO_THRESHOLD: f64 = 0.25;
const SEPARATOR_LINE_LENGTH: usize = 2000;
const SEPARATOR_CHARS: [char; 4] = ['|', '-', '_', '='];

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionFlag {
    RepeatedLines { max_run: usize },
    LowUniqueRatio { ratio: f64 },
    CorruptedSeparator { line_length: usize },
    DataMissing { marker_count: usize },
}

impl CorruptionFlag {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RepeatedLines { .. } => "repeated_lines",
            Self::LowUniqueRatio { .. } => "low_unique_ratio",
            Self::CorruptedSeparator { .. } => "corrupted_separator",
            Self::DataMissing { .. } => "data_missing",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorruptionDetector {
    missing_marker: Option<String>,
}

impl CorruptionDetector {
    pub fn new() -> Self {
        Self {
            missing_marker: None,
        }
    }

    pub fn with_missing_marker(marker: &str) -> Self {
        Self {
            missing_marker: Some(marker.to_string()),
        }
    }

    // Rules are checked in a fixed order and the first match wins, so a page
    // dominated by one repeated block is reported as repeated_lines rather
    // than low_unique_ratio.
    pub fn classify(&self, text: &str) -> Option<CorruptionFlag> {
        let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();

        if lines.len() < MIN_LINES_FOR_ANALYSIS {
            return None;
        }

        let max_run = longest_identical_run(&lines);
        if max_run >= REPEATED_RUN_THRESHOLD {
            return Some(CorruptionFlag::RepeatedLines { max_run });
        }

        let distinct = distinct_line_count(&lines);
        let ratio = distinct as f64 / lines.len() as f64;
        if ratio < UNIQUE_RATIO_THRESHOLD {
            return Some(CorruptionFlag::LowUniqueRatio {
                ratio: round_ratio(ratio),
            });
        }

        for line in &lines {
            let line_length = line.chars().count();
            if line_length > SEPARATOR_LINE_LENGTH {
                let separator_count = line
                    .chars()
                    .filter(|ch| SEPARATOR_CHARS.contains(ch))
                    .count();
                if separator_count * 2 > line_length {
                    return Some(CorruptionFlag::CorruptedSeparator { line_length });
                }
            }
        }

        if let Some(marker) = &self.missing_marker {
            let marker_count = text.matches(marker.as_str()).count();
            if marker_count > 0 {
                return Some(CorruptionFlag::DataMissing { marker_count });
            }
        }

        None
    }
}

fn longest_identical_run(lines: &[&str]) -> usize {
    let mut max_run = 0;
    let mut current_run = 0;
    let mut previous: Option<&str> = None;

    for line in lines {
        if previous == Some(line) {
            current_run += 1;
        } else {
            current_run = 1;
            previous = Some(line);
        }
        max_run = max_run.max(current_run);
    }

    max_run
}

fn distinct_line_count(lines: &[&str]) -> usize {
    let mut seen = std::collections::HashSet::new();
    for line in lines {
        seen.insert(*line);
    }
    seen.len()
}

fn round_ratio(ratio: f64) -> f64 {
    (ratio * 1000.0).round() / 1000.0
}
