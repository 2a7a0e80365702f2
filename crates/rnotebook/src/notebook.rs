//! R Markdown document ↔ cell conversion.
//!
//! A document is a sequence of markdown spans, an optional YAML front matter
//! block on the very first line, and fenced chunks:
//!
//! ````text
//! ---
//! title: "Report"
//! ---
//!
//! Some prose.
//!
//! ```{r setup, echo=FALSE}
//! library(stats)
//! ```
//! ````
//!
//! Chunks keep their fence lines verbatim so that chunk options and line
//! endings survive a parse/serialize round trip.

use serde::Serialize;

const CHUNK_FENCE: &str = "```";
const YAML_DELIMITER: &str = "---";
const YAML_END: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Markdown,
    Code,
}

/// Fence lines of a code cell, including their line terminators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fence {
    pub header: String,
    /// Empty when the chunk ran to the end of the document unclosed
    pub footer: String,
    /// Body was a single empty line, which leaves `source` empty
    pub blank_body: bool,
}

impl Fence {
    fn line_ending(&self) -> &'static str {
        if self.header.ends_with("\r\n") {
            "\r\n"
        } else {
            "\n"
        }
    }
}

/// Parsed `{r label, key=value, ...}` chunk header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkHeader {
    pub language: String,
    pub label: Option<String>,
    /// Options in source order, values unparsed
    pub options: Vec<(String, String)>,
}

impl ChunkHeader {
    /// Parse the text between the braces of a chunk header.
    pub fn parse(inner: &str) -> Option<Self> {
        let inner = inner.trim();
        let lang_end = inner
            .find(|c: char| c.is_whitespace() || c == ',')
            .unwrap_or(inner.len());
        let language = &inner[..lang_end];
        if language.is_empty() || language.contains('=') {
            return None;
        }

        let mut header = ChunkHeader {
            language: language.to_string(),
            ..Default::default()
        };
        let rest = inner[lang_end..].trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        for (i, part) in split_options(rest).into_iter().enumerate() {
            match part.split_once('=') {
                Some((key, value)) => header
                    .options
                    .push((key.trim().to_string(), value.trim().to_string())),
                None if i == 0 => header.label = Some(part),
                None => header.options.push((part, String::new())),
            }
        }
        Some(header)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Chunk label, from the positional label or a `label=` option.
    pub fn label(&self) -> Option<&str> {
        self.label
            .as_deref()
            .or_else(|| self.option("label").map(|v| v.trim_matches(['"', '\''])))
    }

    /// False for `eval=FALSE` chunks.
    pub fn evaluates(&self) -> bool {
        !matches!(self.option("eval"), Some("FALSE" | "F" | "false"))
    }
}

/// Split on top-level commas, ignoring commas inside quotes or brackets.
fn split_options(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                let part = current.trim();
                if !part.is_empty() {
                    parts.push(part.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let part = current.trim();
    if !part.is_empty() {
        parts.push(part.to_string());
    }
    parts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub kind: CellKind,
    /// `markdown`, `yaml`, or the chunk language as written
    pub language: String,
    pub source: String,
    pub fence: Option<Fence>,
    pub chunk: Option<ChunkHeader>,
    pub runnable: bool,
    /// First line of the cell in the source document (0-based)
    pub start_line: usize,
    /// One past the last line
    pub end_line: usize,
}

impl Cell {
    pub fn markdown(source: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Markdown,
            language: "markdown".to_string(),
            source: source.into(),
            fence: None,
            chunk: None,
            runnable: false,
            start_line: 0,
            end_line: 0,
        }
    }

    /// A code cell without retained fences; serialization synthesizes them.
    pub fn code(language: &str, source: impl Into<String>, target_language: &str) -> Self {
        Self {
            kind: CellKind::Code,
            language: language.to_string(),
            source: source.into(),
            fence: None,
            chunk: None,
            runnable: language.eq_ignore_ascii_case(target_language),
            start_line: 0,
            end_line: 0,
        }
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    pub fn is_front_matter(&self) -> bool {
        self.kind == CellKind::Code && self.language == "yaml" && self.chunk.is_none()
    }

    /// Whether "run all" should evaluate this cell.
    pub fn evaluates(&self) -> bool {
        self.runnable && self.chunk.as_ref().map_or(true, ChunkHeader::evaluates)
    }

    pub fn contains_line(&self, line: usize) -> bool {
        (self.start_line..self.end_line).contains(&line)
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn is_yaml_open(line: &str) -> bool {
    strip_line_ending(line).trim_end() == YAML_DELIMITER
}

fn is_yaml_close(line: &str) -> bool {
    matches!(strip_line_ending(line).trim_end(), YAML_DELIMITER | YAML_END)
}

/// `` ```{lang ...} `` with optional space before the brace.
fn chunk_open(line: &str) -> Option<ChunkHeader> {
    let rest = strip_line_ending(line).strip_prefix(CHUNK_FENCE)?;
    let inner = rest
        .trim_start()
        .strip_prefix('{')?
        .trim_end()
        .strip_suffix('}')?;
    ChunkHeader::parse(inner)
}

fn is_fence(line: &str) -> bool {
    line.starts_with(CHUNK_FENCE)
}

/// A bare run of backticks, as closes a plain markdown code block.
fn is_bare_fence(line: &str) -> bool {
    is_fence(line) && strip_line_ending(line).trim_end().trim_matches('`').is_empty()
}

/// Join body lines, dropping the final line terminator.
fn body_source(lines: &[&str]) -> String {
    let mut body = lines.concat();
    if body.ends_with('\n') {
        body.pop();
        if body.ends_with('\r') {
            body.pop();
        }
    }
    body
}

fn is_blank_body(lines: &[&str]) -> bool {
    matches!(lines, [line] if strip_line_ending(line).is_empty())
}

enum ScanState {
    Markdown { start: usize, in_plain_fence: bool },
    FrontMatter,
    Chunk { start: usize, header: ChunkHeader },
}

/// Split `text` into cells. Chunks whose language matches `target_language`
/// (case-insensitive) are runnable.
pub fn parse(text: &str, target_language: &str) -> Vec<Cell> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let with_front_matter = lines.first().is_some_and(|l| is_yaml_open(l));
    match scan(&lines, target_language, with_front_matter) {
        Some(cells) => cells,
        // Unterminated front matter is just markdown.
        None => scan(&lines, target_language, false).unwrap_or_default(),
    }
}

fn scan(lines: &[&str], target_language: &str, with_front_matter: bool) -> Option<Vec<Cell>> {
    let mut cells = Vec::new();
    let mut state = if with_front_matter {
        ScanState::FrontMatter
    } else {
        ScanState::Markdown {
            start: 0,
            in_plain_fence: false,
        }
    };

    for (i, line) in lines.iter().enumerate() {
        state = match state {
            ScanState::Markdown {
                start,
                in_plain_fence,
            } => {
                if in_plain_fence {
                    ScanState::Markdown {
                        start,
                        in_plain_fence: !is_bare_fence(line),
                    }
                } else if let Some(header) = chunk_open(line) {
                    cells.push(markdown_cell(lines, start, i));
                    ScanState::Chunk { start: i, header }
                } else {
                    ScanState::Markdown {
                        start,
                        in_plain_fence: is_fence(line),
                    }
                }
            }
            ScanState::FrontMatter => {
                if i > 0 && is_yaml_close(line) {
                    cells.push(Cell {
                        kind: CellKind::Code,
                        language: "yaml".to_string(),
                        source: body_source(&lines[1..i]),
                        fence: Some(Fence {
                            header: lines[0].to_string(),
                            footer: line.to_string(),
                            blank_body: is_blank_body(&lines[1..i]),
                        }),
                        chunk: None,
                        runnable: false,
                        start_line: 0,
                        end_line: i + 1,
                    });
                    ScanState::Markdown {
                        start: i + 1,
                        in_plain_fence: false,
                    }
                } else {
                    ScanState::FrontMatter
                }
            }
            ScanState::Chunk { start, header } => {
                if is_fence(line) {
                    cells.push(chunk_cell(lines, start, i, Some(line), header, target_language));
                    ScanState::Markdown {
                        start: i + 1,
                        in_plain_fence: false,
                    }
                } else {
                    ScanState::Chunk { start, header }
                }
            }
        };
    }

    match state {
        ScanState::Markdown { start, .. } => {
            if start < lines.len() {
                cells.push(markdown_cell(lines, start, lines.len()));
            }
        }
        ScanState::FrontMatter => return None,
        ScanState::Chunk { start, header } => {
            cells.push(chunk_cell(
                lines,
                start,
                lines.len(),
                None,
                header,
                target_language,
            ));
        }
    }
    Some(cells)
}

fn markdown_cell(lines: &[&str], start: usize, end: usize) -> Cell {
    Cell {
        start_line: start,
        end_line: end,
        ..Cell::markdown(lines[start..end].concat())
    }
}

fn chunk_cell(
    lines: &[&str],
    start: usize,
    close: usize,
    footer: Option<&str>,
    header: ChunkHeader,
    target_language: &str,
) -> Cell {
    Cell {
        kind: CellKind::Code,
        runnable: header.language.eq_ignore_ascii_case(target_language),
        language: header.language.clone(),
        source: body_source(&lines[start + 1..close]),
        fence: Some(Fence {
            header: lines[start].to_string(),
            footer: footer.unwrap_or_default().to_string(),
            blank_body: is_blank_body(&lines[start + 1..close]),
        }),
        chunk: Some(header),
        start_line: start,
        end_line: if footer.is_some() { close + 1 } else { close },
    }
}

fn default_fence(cell: &Cell) -> Fence {
    if cell.is_front_matter() {
        Fence {
            header: format!("{}\n", YAML_DELIMITER),
            footer: format!("{}\n", YAML_DELIMITER),
            blank_body: false,
        }
    } else {
        Fence {
            header: format!("{}{{{}}}\n", CHUNK_FENCE, cell.language),
            footer: format!("{}\n", CHUNK_FENCE),
            blank_body: false,
        }
    }
}

/// Reassemble document text from cells.
pub fn serialize(cells: &[Cell]) -> String {
    let mut out = String::new();
    for cell in cells {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        match cell.kind {
            CellKind::Markdown => out.push_str(&cell.source),
            CellKind::Code => {
                let synthesized;
                let fence = match &cell.fence {
                    Some(fence) => fence,
                    None => {
                        synthesized = default_fence(cell);
                        &synthesized
                    }
                };
                out.push_str(&fence.header);
                if !cell.source.is_empty() {
                    if !out.ends_with('\n') {
                        out.push_str(fence.line_ending());
                    }
                    out.push_str(&cell.source);
                    out.push_str(fence.line_ending());
                } else if fence.blank_body {
                    out.push_str(fence.line_ending());
                }
                out.push_str(&fence.footer);
            }
        }
    }
    out
}

/// Index of the cell covering `line` (0-based).
pub fn cell_at_line(cells: &[Cell], line: usize) -> Option<usize> {
    cells.iter().position(|cell| cell.contains_line(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\ntitle: \"Report\"\noutput: html_document\n---\n\nIntro text.\n\n```{r setup, include=FALSE}\nlibrary(stats)\n```\n\nMore prose.\n\n```{python}\nprint(1)\n```\n```{r}\n1+1\n\n```\n";

    #[test]
    fn test_parse_document() {
        let cells = parse(DOC, "r");
        let kinds: Vec<(&str, bool)> = cells
            .iter()
            .map(|c| (c.language.as_str(), c.runnable))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("yaml", false),
                ("markdown", false),
                ("r", true),
                ("markdown", false),
                ("python", false),
                ("markdown", false),
                ("r", true),
            ]
        );

        assert!(cells[0].is_front_matter());
        assert_eq!(cells[0].source, "title: \"Report\"\noutput: html_document");
        assert_eq!(cells[1].source, "\nIntro text.\n\n");
        assert_eq!(cells[2].source, "library(stats)");
        assert_eq!(
            cells[2].fence.as_ref().unwrap().header,
            "```{r setup, include=FALSE}\n"
        );
        assert_eq!(cells[2].chunk.as_ref().unwrap().label(), Some("setup"));
        // Adjacent chunks still get a (possibly empty) markdown span.
        assert_eq!(cells[5].source, "");
        assert_eq!(cells[6].source, "1+1\n");
    }

    #[test]
    fn test_line_ranges() {
        let cells = parse(DOC, "r");
        assert_eq!((cells[0].start_line, cells[0].end_line), (0, 4));
        assert_eq!((cells[2].start_line, cells[2].end_line), (7, 10));
        assert_eq!(cell_at_line(&cells, 8), Some(2));
        assert_eq!(cell_at_line(&cells, 5), Some(1));
        assert_eq!(cell_at_line(&cells, 100), None);
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        assert_eq!(serialize(&parse(DOC, "r")), DOC);
        for doc in [
            "```{r}\n\n```\n",
            "```{r}\n```\n",
            "```{r}\n\n\n```\n",
            "---\n\n---\n",
            "```{r}\r\n\r\n```\r\n",
        ] {
            assert_eq!(serialize(&parse(doc, "r")), doc);
        }
    }

    #[test]
    fn test_blank_chunk_body() {
        let blank = parse("```{r}\n\n```\n", "r");
        let empty = parse("```{r}\n```\n", "r");
        assert_eq!(blank[1].source, "");
        assert_eq!(empty[1].source, "");
        assert!(blank[1].fence.as_ref().unwrap().blank_body);
        assert!(!empty[1].fence.as_ref().unwrap().blank_body);
        assert_eq!(blank[1].end_line, 3);
    }

    #[test]
    fn test_roundtrip_crlf() {
        let doc = "Text\r\n```{r}\r\nx <- 1\r\ny <- 2\r\n```\r\n";
        let cells = parse(doc, "r");
        assert_eq!(cells[1].source, "x <- 1\r\ny <- 2");
        assert_eq!(serialize(&cells), doc);
    }

    #[test]
    fn test_roundtrip_idempotent_under_reparse() {
        let docs = [
            "",
            "just prose",
            "```{r}\n```\n",
            "```{r}\n1\n```",
            "```{R, echo=FALSE}\nplot(1)\n```\ntrailing",
            "---\na: 1\n...\nbody\n",
            "```{r}\nunterminated",
        ];
        for doc in docs {
            let once = parse(doc, "r");
            let twice = parse(&serialize(&once), "r");
            let strip = |cells: &[Cell]| -> Vec<(CellKind, String, String)> {
                cells
                    .iter()
                    .map(|c| (c.kind, c.language.clone(), c.source.clone()))
                    .collect()
            };
            assert_eq!(strip(&once), strip(&twice), "document {:?}", doc);
        }
    }

    #[test]
    fn test_front_matter_only_on_first_line() {
        let cells = parse("text\n---\nnot: yaml\n---\n", "r");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].kind, CellKind::Markdown);
    }

    #[test]
    fn test_unterminated_front_matter_is_markdown() {
        let doc = "---\ntitle: x\n```{r}\n1\n```\n";
        let cells = parse(doc, "r");
        assert_eq!(cells[0].kind, CellKind::Markdown);
        assert_eq!(cells[0].source, "---\ntitle: x\n");
        assert_eq!(cells[1].source, "1");
        assert_eq!(serialize(&cells), doc);
    }

    #[test]
    fn test_unterminated_chunk() {
        let cells = parse("```{r}\nx <- 1\n", "r");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[1].source, "x <- 1");
        assert_eq!(cells[1].fence.as_ref().unwrap().footer, "");
        assert_eq!(cells[1].end_line, 2);
    }

    #[test]
    fn test_language_match_is_case_insensitive() {
        let cells = parse("```{R}\n1\n```\n", "r");
        assert!(cells[1].runnable);
        assert_eq!(cells[1].language, "R");
    }

    #[test]
    fn test_plain_fence_does_not_open_chunk() {
        let doc = "```\n```{r}\n```\n";
        let cells = parse(doc, "r");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].kind, CellKind::Markdown);
        assert_eq!(serialize(&cells), doc);
    }

    #[test]
    fn test_serialize_synthesizes_fences() {
        let cells = vec![
            Cell::markdown("Intro"),
            Cell::code("r", "1+1", "r"),
            Cell::code("python", "", "r"),
        ];
        assert_eq!(
            serialize(&cells),
            "Intro\n```{r}\n1+1\n```\n```{python}\n```\n"
        );
    }

    #[test]
    fn test_chunk_header_parse() {
        let header =
            ChunkHeader::parse("r plot-1, fig.cap=\"a, b\", fig.dim=c(7, 5), eval=FALSE").unwrap();
        assert_eq!(header.language, "r");
        assert_eq!(header.label(), Some("plot-1"));
        assert_eq!(header.option("fig.cap"), Some("\"a, b\""));
        assert_eq!(header.option("fig.dim"), Some("c(7, 5)"));
        assert!(!header.evaluates());

        let header = ChunkHeader::parse("r, label='named', echo=TRUE").unwrap();
        assert_eq!(header.label, None);
        assert_eq!(header.label(), Some("named"));
        assert!(header.evaluates());

        assert!(ChunkHeader::parse("").is_none());
        assert!(ChunkHeader::parse("eval=FALSE").is_none());
    }

    #[test]
    fn test_eval_false_cell_does_not_evaluate() {
        let cells = parse("```{r eval=F}\nstop()\n```\n```{r}\n1\n```\n", "r");
        assert!(cells[1].runnable);
        assert!(!cells[1].evaluates());
        assert!(cells[3].evaluates());
    }
}
