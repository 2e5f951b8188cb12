use serde::{Deserialize, Serialize};

/// Closed set of supported operations. Dispatch is by exhaustive match; adding
/// a kind means the compiler walks every site that must learn about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Merge,
    Split,
    Scan,
    ConvertWord,
    ConvertPowerPoint,
    ConvertExcel,
    Compress,
    MarkdownToPdf,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 8] = [
        WorkflowKind::Merge,
        WorkflowKind::Split,
        WorkflowKind::Scan,
        WorkflowKind::ConvertWord,
        WorkflowKind::ConvertPowerPoint,
        WorkflowKind::ConvertExcel,
        WorkflowKind::Compress,
        WorkflowKind::MarkdownToPdf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Merge => "merge",
            WorkflowKind::Split => "split",
            WorkflowKind::Scan => "scan",
            WorkflowKind::ConvertWord => "convert_word",
            WorkflowKind::ConvertPowerPoint => "convert_powerpoint",
            WorkflowKind::ConvertExcel => "convert_excel",
            WorkflowKind::Compress => "compress",
            WorkflowKind::MarkdownToPdf => "markdown_to_pdf",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// Maps a start command ("merge pdf", "scan document", ...) to its kind.
    pub fn from_start_command(command: &str) -> Option<Self> {
        match command.trim().to_lowercase().as_str() {
            "merge pdf" => Some(WorkflowKind::Merge),
            "split pdf" => Some(WorkflowKind::Split),
            "scan document" => Some(WorkflowKind::Scan),
            "word to pdf" => Some(WorkflowKind::ConvertWord),
            "powerpoint to pdf" => Some(WorkflowKind::ConvertPowerPoint),
            "excel to pdf" => Some(WorkflowKind::ConvertExcel),
            "compress pdf" => Some(WorkflowKind::Compress),
            "markdown to pdf" => Some(WorkflowKind::MarkdownToPdf),
            _ => None,
        }
    }

    pub fn instructions(self) -> &'static str {
        match self {
            WorkflowKind::Merge => {
                "Started PDF merge. Send PDFs one by one; they are merged in arrival order. Send 'done' when finished."
            }
            WorkflowKind::Split => {
                "Started PDF split. Send the PDF to split, then 'done'. You will be asked for page ranges (e.g. '1-10, 15, 20-25')."
            }
            WorkflowKind::Scan => {
                "Started document scan. Send images one by one. Send 'done' when finished."
            }
            WorkflowKind::ConvertWord => {
                "Started Word to PDF conversion. Send your .doc or .docx documents one by one, then 'done'."
            }
            WorkflowKind::ConvertPowerPoint => {
                "Started PowerPoint to PDF conversion. Send your presentations one by one, then 'done'."
            }
            WorkflowKind::ConvertExcel => {
                "Started Excel to PDF conversion. Send your spreadsheets one by one, then 'done'."
            }
            WorkflowKind::Compress => {
                "Started PDF compression. Send PDFs one by one, then 'done'. You can pick a level: low, medium, high, max (or 1-4, or 'auto')."
            }
            WorkflowKind::MarkdownToPdf => {
                "Started markdown to PDF conversion. Send markdown text messages one by one; they are combined in order. Send 'done' when finished."
            }
        }
    }

    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            WorkflowKind::Merge | WorkflowKind::Split | WorkflowKind::Compress => &["pdf"],
            WorkflowKind::Scan => &["jpg", "jpeg", "png"],
            WorkflowKind::ConvertWord => &["doc", "docx"],
            WorkflowKind::ConvertPowerPoint => &["ppt", "pptx", "pptm", "pps", "ppsx", "ppsm"],
            WorkflowKind::ConvertExcel => &["xls", "xlsx", "xlsm", "xlsb", "csv"],
            WorkflowKind::MarkdownToPdf => &[],
        }
    }

    pub fn accepts_file(self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.allowed_extensions()
            .iter()
            .any(|ext| lowered.ends_with(&format!(".{ext}")))
    }

    pub fn min_inputs(self) -> usize {
        match self {
            WorkflowKind::Merge => 2,
            _ => 1,
        }
    }

    pub fn max_files(self) -> Option<usize> {
        match self {
            WorkflowKind::Split => Some(1),
            WorkflowKind::MarkdownToPdf => Some(0),
            _ => None,
        }
    }

    /// Kinds that pause for parameters between input collection and
    /// processing.
    pub fn needs_configuring(self) -> bool {
        matches!(self, WorkflowKind::Split | WorkflowKind::Compress)
    }

    pub fn collects_text(self) -> bool {
        matches!(self, WorkflowKind::MarkdownToPdf)
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    CollectingInput,
    Configuring,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (TaskState::Created, TaskState::CollectingInput)
                | (TaskState::Created, TaskState::Failed)
                | (TaskState::Created, TaskState::Cancelled)
                | (TaskState::CollectingInput, TaskState::Configuring)
                | (TaskState::CollectingInput, TaskState::Processing)
                | (TaskState::CollectingInput, TaskState::Failed)
                | (TaskState::CollectingInput, TaskState::Cancelled)
                | (TaskState::Configuring, TaskState::Processing)
                | (TaskState::Configuring, TaskState::Failed)
                | (TaskState::Configuring, TaskState::Cancelled)
                | (TaskState::Processing, TaskState::Completed)
                | (TaskState::Processing, TaskState::Failed)
                | (TaskState::Processing, TaskState::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::CollectingInput => "collecting_input",
            TaskState::Configuring => "configuring",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            TaskState::Created,
            TaskState::CollectingInput,
            TaskState::Configuring,
            TaskState::Processing,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ]
        .into_iter()
        .find(|state| state.as_str() == raw)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bad input from the remote party. The Display text is the user-facing
/// message; routing reports it and leaves the task state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("That file type is not supported here. Expected: {expected}.")]
    UnsupportedFile { expected: String },
    #[error("This workflow takes at most {max} file(s); send 'done' or 'cancel'.")]
    TooManyFiles { max: usize },
    #[error("Need at least {needed} input(s) before processing; you have {have}.")]
    NotEnoughInputs { needed: usize, have: usize },
    #[error("Invalid range '{part}'. {reason}")]
    MalformedRange { part: String, reason: String },
    #[error("Invalid range '{part}'. Pages must be between 1 and {max}.")]
    RangeOutOfBounds { part: String, max: u32 },
    #[error("Please specify page ranges, e.g. '1-10, 15, 20-25'.")]
    EmptyRanges,
    #[error("Invalid compression level '{input}'. Use low, medium, high, max, 1-4, or 'auto'.")]
    UnknownCompressionLevel { input: String },
}

impl ValidationError {
    pub fn unsupported_file(kind: WorkflowKind) -> Self {
        ValidationError::UnsupportedFile {
            expected: kind.allowed_extensions().join(", "),
        }
    }
}

/// Parses "1-10, 15, 20-25" into sorted, merged inclusive 1-based ranges.
/// Overlapping and adjacent ranges collapse; bounds are enforced when the
/// document's page count is known.
pub fn parse_page_ranges(
    input: &str,
    max_pages: Option<u32>,
) -> Result<Vec<(u32, u32)>, ValidationError> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();

    for part in input.split([',', '\n', ' ', '\t']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end) = if let Some((start_str, end_str)) = part.split_once('-') {
            let start = start_str.trim().parse::<u32>().map_err(|_| {
                ValidationError::MalformedRange {
                    part: part.to_string(),
                    reason: "Use start-end with whole numbers.".to_string(),
                }
            })?;
            let end = end_str.trim().parse::<u32>().map_err(|_| {
                ValidationError::MalformedRange {
                    part: part.to_string(),
                    reason: "Use start-end with whole numbers.".to_string(),
                }
            })?;
            (start, end)
        } else {
            let page = part
                .parse::<u32>()
                .map_err(|_| ValidationError::MalformedRange {
                    part: part.to_string(),
                    reason: "Use numbers or ranges.".to_string(),
                })?;
            (page, page)
        };

        if start == 0 || start > end {
            return Err(ValidationError::MalformedRange {
                part: part.to_string(),
                reason: "Start must be at least 1 and not greater than end.".to_string(),
            });
        }
        if let Some(max) = max_pages {
            if end > max {
                return Err(ValidationError::RangeOutOfBounds {
                    part: part.to_string(),
                    max,
                });
            }
        }
        ranges.push((start, end));
    }

    if ranges.is_empty() {
        return Err(ValidationError::EmptyRanges);
    }

    ranges.sort_by_key(|(start, _)| *start);
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, current_end)) if start <= *current_end + 1 => {
                *current_end = (*current_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    Ok(merged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPart {
    pub start: u32,
    pub end: u32,
    pub requested: bool,
}

/// Expands merged ranges into the full cut list, gap parts included, so the
/// split covers the entire document when the page count is known.
pub fn split_definitions(ranges: &[(u32, u32)], total_pages: Option<u32>) -> Vec<SplitPart> {
    let mut parts = Vec::new();
    let mut current = 1u32;

    for &(start, end) in ranges {
        if current < start {
            parts.push(SplitPart {
                start: current,
                end: start - 1,
                requested: false,
            });
        }
        parts.push(SplitPart {
            start,
            end,
            requested: true,
        });
        current = end + 1;
    }

    if let Some(total) = total_pages {
        if current <= total {
            parts.push(SplitPart {
                start: current,
                end: total,
                requested: false,
            });
        }
    }

    parts.retain(|p| p.start <= p.end);
    parts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Low,
    Medium,
    High,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPreset {
    pub dpi: u32,
    pub jpeg_quality: u32,
    pub pdfsettings: &'static str,
}

impl CompressionLevel {
    /// Accepts level names, the numeric aliases 1-4, and `auto` (which the
    /// original resolved to medium).
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        match input.trim().to_lowercase().as_str() {
            "low" | "1" => Ok(CompressionLevel::Low),
            "medium" | "2" | "auto" => Ok(CompressionLevel::Medium),
            "high" | "3" => Ok(CompressionLevel::High),
            "max" | "4" => Ok(CompressionLevel::Max),
            other => Err(ValidationError::UnknownCompressionLevel {
                input: other.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionLevel::Low => "low",
            CompressionLevel::Medium => "medium",
            CompressionLevel::High => "high",
            CompressionLevel::Max => "max",
        }
    }

    pub fn preset(self) -> CompressionPreset {
        match self {
            CompressionLevel::Low => CompressionPreset {
                dpi: 150,
                jpeg_quality: 90,
                pdfsettings: "/printer",
            },
            CompressionLevel::Medium => CompressionPreset {
                dpi: 120,
                jpeg_quality: 80,
                pdfsettings: "/ebook",
            },
            CompressionLevel::High => CompressionPreset {
                dpi: 96,
                jpeg_quality: 70,
                pdfsettings: "/screen",
            },
            CompressionLevel::Max => CompressionPreset {
                dpi: 72,
                jpeg_quality: 60,
                pdfsettings: "/ebook",
            },
        }
    }
}

/// Scan output versions produced per image by the scanner tool, suffix is the
/// file-stem suffix the scanner uses for that version.
pub const SCAN_VERSIONS: [(&str, &str); 3] =
    [("original", ""), ("bw", "_BW"), ("bw_direct", "_BW_direct")];

/// Metadata keys shared between router and executor.
pub mod meta {
    pub const RANGES: &str = "ranges";
    pub const PAGE_COUNT: &str = "pageCount";
    pub const COMPRESSION_LEVEL: &str = "compressionLevel";
    pub const MARKDOWN_FRAGMENTS: &str = "markdownFragments";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_commands_cover_all_eight_kinds() {
        let commands = [
            ("merge pdf", WorkflowKind::Merge),
            ("split pdf", WorkflowKind::Split),
            ("scan document", WorkflowKind::Scan),
            ("word to pdf", WorkflowKind::ConvertWord),
            ("powerpoint to pdf", WorkflowKind::ConvertPowerPoint),
            ("excel to pdf", WorkflowKind::ConvertExcel),
            ("compress pdf", WorkflowKind::Compress),
            ("Markdown To PDF", WorkflowKind::MarkdownToPdf),
        ];
        for (command, kind) in commands {
            assert_eq!(WorkflowKind::from_start_command(command), Some(kind));
        }
        assert_eq!(WorkflowKind::from_start_command("make coffee"), None);
    }

    #[test]
    fn kind_round_trips_through_its_string_form() {
        for kind in WorkflowKind::ALL {
            assert_eq!(WorkflowKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn transition_table_matches_the_state_machine() {
        use TaskState::*;
        assert!(Created.can_transition_to(CollectingInput));
        assert!(CollectingInput.can_transition_to(Processing));
        assert!(CollectingInput.can_transition_to(Configuring));
        assert!(Configuring.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        for state in [Created, CollectingInput, Configuring, Processing] {
            assert!(state.can_transition_to(Cancelled), "{state} -> cancelled");
        }
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Created, CollectingInput, Configuring, Processing, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Created.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(CollectingInput));
    }

    #[test]
    fn page_ranges_merge_overlaps_and_adjacency() {
        let ranges = parse_page_ranges("1-3, 4, 8-9, 2-5", Some(20)).expect("parse");
        assert_eq!(ranges, vec![(1, 5), (8, 9)]);
    }

    #[test]
    fn inverted_range_is_a_validation_error() {
        let err = parse_page_ranges("10-5", Some(3)).expect_err("inverted");
        assert!(matches!(err, ValidationError::MalformedRange { .. }));
    }

    #[test]
    fn out_of_bounds_range_is_rejected_when_page_count_known() {
        let err = parse_page_ranges("2-9", Some(3)).expect_err("out of bounds");
        assert!(matches!(err, ValidationError::RangeOutOfBounds { max: 3, .. }));
        parse_page_ranges("2-9", None).expect("unknown page count defers bounds");
    }

    #[test]
    fn split_definitions_fill_gaps_when_total_known() {
        let parts = split_definitions(&[(3, 4), (8, 8)], Some(10));
        assert_eq!(
            parts,
            vec![
                SplitPart { start: 1, end: 2, requested: false },
                SplitPart { start: 3, end: 4, requested: true },
                SplitPart { start: 5, end: 7, requested: false },
                SplitPart { start: 8, end: 8, requested: true },
                SplitPart { start: 9, end: 10, requested: false },
            ]
        );
    }

    #[test]
    fn compression_levels_accept_aliases() {
        assert_eq!(
            CompressionLevel::parse("2").expect("numeric"),
            CompressionLevel::Medium
        );
        assert_eq!(
            CompressionLevel::parse("auto").expect("auto"),
            CompressionLevel::Medium
        );
        assert_eq!(
            CompressionLevel::parse("MAX").expect("case"),
            CompressionLevel::Max
        );
        assert!(CompressionLevel::parse("ultra").is_err());
    }

    #[test]
    fn file_acceptance_follows_the_kind() {
        assert!(WorkflowKind::Merge.accepts_file("a.PDF"));
        assert!(!WorkflowKind::Merge.accepts_file("a.docx"));
        assert!(WorkflowKind::Scan.accepts_file("page.jpeg"));
        assert!(WorkflowKind::ConvertExcel.accepts_file("data.csv"));
        assert!(!WorkflowKind::MarkdownToPdf.accepts_file("notes.md"));
    }
}
