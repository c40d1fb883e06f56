//! Local paper library stored as one JSON file per paper.
//!
//! Each file looks like:
//!
//! ```json
//! {
//!   "paper_id": "2006.10637",
//!   "title": "Temporal Graph Networks for Deep Learning on Dynamic Graphs",
//!   "link": "https://arxiv.org/abs/2006.10637",
//!   "authors": "Emanuele Rossi, Ben Chamberlain",
//!   "abstract": "...",
//!   "year": 2020,
//!   "sections": [{ "title": "Introduction", "content": "..." }]
//! }
//! ```
//!
//! Only `link` and `sections` are required. A missing `paper_id` is derived
//! from an arXiv link, or from the file name otherwise. `authors` may be a
//! comma separated line or a list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ExtractedSection, PaperDiscovery, ProviderError, ProviderResult, SectionExtractor};
use crate::models::{Author, PaperMetadata, PaperRef};

#[derive(Debug, Deserialize)]
struct PaperFile {
    #[serde(default)]
    paper_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    link: String,
    #[serde(default)]
    authors: AuthorsField,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    sections: Vec<SectionFile>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AuthorsField {
    Line(String),
    List(Vec<String>),
}

impl Default for AuthorsField {
    fn default() -> Self {
        AuthorsField::List(Vec::new())
    }
}

impl AuthorsField {
    fn into_authors(self) -> Vec<Author> {
        match self {
            AuthorsField::Line(line) => Author::parse_list(&line),
            AuthorsField::List(names) => names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .map(Author::named)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SectionFile {
    title: String,
    content: String,
}

#[derive(Debug, Clone)]
struct LibraryEntry {
    reference: PaperRef,
    sections: Vec<ExtractedSection>,
    /// Lowercased title, abstract and section titles used for topic matching
    haystack: String,
}

/// A directory of paper JSON files acting as both discovery and extraction.
#[derive(Debug, Clone)]
pub struct JsonPaperLibrary {
    dir: PathBuf,
    entries: Vec<LibraryEntry>,
    by_id: HashMap<String, usize>,
    max_results: Option<usize>,
}

impl JsonPaperLibrary {
    /// Load every `*.json` file in `dir`.
    ///
    /// Files that cannot be read or parsed are skipped with a warning. Files are read
    /// in name order, so discovery results are stable between runs.
    ///
    /// # Errors
    /// Returns `ProviderError::IoError` if the directory cannot be listed
    pub async fn open(dir: impl AsRef<Path>) -> ProviderResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut reader = tokio::fs::read_dir(&dir).await?;

        let mut paths = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut library = Self {
            dir,
            entries: Vec::with_capacity(paths.len()),
            by_id: HashMap::new(),
            max_results: None,
        };

        for path in paths {
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable paper file");
                    continue;
                }
            };
            match parse_entry(&path, &raw) {
                Ok(entry) => library.push(entry),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable paper file"),
            }
        }

        debug!(dir = %library.dir.display(), papers = library.entries.len(), "loaded paper library");
        Ok(library)
    }

    /// Cap the number of papers returned per topic.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: LibraryEntry) {
        let id = entry.reference.paper_id.clone();
        if self.by_id.contains_key(&id) {
            warn!(paper_id = %id, "duplicate paper id in library, keeping the first file");
            return;
        }
        self.by_id.insert(id, self.entries.len());
        self.entries.push(entry);
    }
}

fn parse_entry(path: &Path, raw: &str) -> ProviderResult<LibraryEntry> {
    let file: PaperFile = serde_json::from_str(raw)
        .map_err(|e| ProviderError::ParseError(format!("{}: {e}", path.display())))?;

    let arxiv_id = arxiv_id_from_link(&file.link);
    let paper_id = file
        .paper_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| arxiv_id.clone())
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .ok_or_else(|| ProviderError::ParseError(format!("{}: no paper id", path.display())))?;
    let title = file
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| paper_id.clone());

    let sections: Vec<ExtractedSection> = file
        .sections
        .into_iter()
        .map(|s| ExtractedSection::new(s.title.trim(), s.content))
        .collect();

    let mut haystack = format!("{} {}", title, file.abstract_text.as_deref().unwrap_or_default());
    for section in &sections {
        haystack.push(' ');
        haystack.push_str(&section.name);
    }
    if file.abstract_text.is_none() {
        if let Some(first) = sections.first() {
            haystack.push(' ');
            haystack.push_str(&first.text);
        }
    }

    Ok(LibraryEntry {
        reference: PaperRef {
            paper_id,
            title,
            url: file.link,
            abstract_text: file.abstract_text,
            metadata: PaperMetadata {
                authors: file.authors.into_authors(),
                arxiv_id,
                published_year: file.year,
            },
        },
        sections,
        haystack: haystack.to_lowercase(),
    })
}

/// Extract the arXiv identifier from an `abs/` or `pdf/` link.
pub fn arxiv_id_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    if !url.host_str().is_some_and(|h| h.ends_with("arxiv.org")) {
        return None;
    }
    let path = url.path().trim_matches('/');
    let id = if let Some(rest) = path.strip_prefix("abs/") {
        rest
    } else if let Some(rest) = path.strip_prefix("pdf/") {
        rest.strip_suffix(".pdf").unwrap_or(rest)
    } else {
        return None;
    };
    (!id.is_empty()).then(|| id.to_string())
}

fn topic_terms(topic: &str) -> Vec<String> {
    topic
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() > 2)
        .collect()
}

#[async_trait]
impl PaperDiscovery for JsonPaperLibrary {
    async fn find_papers(&self, topic: &str) -> ProviderResult<Vec<PaperRef>> {
        let terms = topic_terms(topic);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let hits = terms.iter().filter(|t| entry.haystack.contains(t.as_str())).count();
                (hits > 0).then_some((i, hits))
            })
            .collect();
        // most matching terms first, then library order
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let limit = self.max_results.unwrap_or(usize::MAX);
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(i, _)| self.entries[i].reference.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "json-library"
    }
}

#[async_trait]
impl SectionExtractor for JsonPaperLibrary {
    async fn extract_sections(&self, paper: &PaperRef) -> ProviderResult<Vec<ExtractedSection>> {
        self.by_id
            .get(&paper.paper_id)
            .map(|&i| self.entries[i].sections.clone())
            .ok_or_else(|| ProviderError::NotFound(paper.paper_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(dir: &Path, name: &str, body: &str) {
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }

    async fn library() -> (tempfile::TempDir, JsonPaperLibrary) {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.json",
            r#"{
                "link": "https://arxiv.org/abs/2006.10637",
                "title": "Temporal Graph Networks",
                "authors": "Emanuele Rossi, Ben Chamberlain",
                "abstract": "Deep learning on dynamic graphs with graph neural networks.",
                "year": 2020,
                "sections": [{"title": "Introduction", "content": "Graphs change over time."}]
            }"#,
        )
        .await;
        write(
            dir.path(),
            "b.json",
            r#"{
                "paper_id": "bert",
                "link": "https://example.org/bert.pdf",
                "authors": ["Jacob Devlin"],
                "sections": [{"title": "Abstract", "content": "Language model pre-training."}]
            }"#,
        )
        .await;
        write(
            dir.path(),
            "c.json",
            r#"{
                "link": "https://arxiv.org/pdf/1609.02907.pdf",
                "title": "Semi-Supervised Classification with Graph Convolutional Networks",
                "sections": []
            }"#,
        )
        .await;
        write(dir.path(), "broken.json", "{ not json").await;
        write(dir.path(), "notes.txt", "ignored").await;

        let lib = JsonPaperLibrary::open(dir.path()).await.unwrap();
        (dir, lib)
    }

    #[test]
    fn test_arxiv_id_from_link() {
        assert_eq!(arxiv_id_from_link("https://arxiv.org/abs/2006.10637").as_deref(), Some("2006.10637"));
        assert_eq!(arxiv_id_from_link("https://arxiv.org/pdf/2006.10637v2.pdf").as_deref(), Some("2006.10637v2"));
        assert_eq!(arxiv_id_from_link("https://example.org/abs/1"), None);
        assert_eq!(arxiv_id_from_link("https://arxiv.org/list/cs.LG"), None);
    }

    #[tokio::test]
    async fn test_loads_valid_files_only() {
        let (_dir, lib) = library().await;
        assert_eq!(lib.len(), 3);
        assert!(lib.by_id.contains_key("2006.10637"));
        assert!(lib.by_id.contains_key("1609.02907"));
        assert!(lib.by_id.contains_key("bert"));
    }

    #[tokio::test]
    async fn test_find_papers_ranks_by_matching_terms() {
        let (_dir, lib) = library().await;
        let papers = lib.find_papers("graph neural networks").await.unwrap();
        let ids: Vec<_> = papers.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["2006.10637", "1609.02907"]);
        assert_eq!(papers[0].metadata.authors.len(), 2);
        assert_eq!(papers[0].metadata.published_year, Some(2020));

        assert!(lib.find_papers("quantum chemistry").await.unwrap().is_empty());
        assert!(lib.find_papers("  ").await.unwrap().is_empty());

        let limited = lib.clone().with_max_results(1);
        assert_eq!(limited.find_papers("graph networks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_extract_sections() {
        let (_dir, lib) = library().await;
        let papers = lib.find_papers("language pre-training").await.unwrap();
        assert_eq!(papers[0].paper_id, "bert");
        assert_eq!(papers[0].title, "bert");

        let sections = lib.extract_sections(&papers[0]).await.unwrap();
        assert_eq!(sections, vec![ExtractedSection::new("Abstract", "Language model pre-training.")]);

        let mut unknown = papers[0].clone();
        unknown.paper_id = "missing".to_string();
        assert!(matches!(lib.extract_sections(&unknown).await, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_non_utf8_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "good.json",
            r#"{"link": "https://arxiv.org/abs/2006.10637", "sections": []}"#,
        )
        .await;
        tokio::fs::write(dir.path().join("latin1.json"), b"{\"link\": \"caf\xe9\"}")
            .await
            .unwrap();

        let lib = JsonPaperLibrary::open(dir.path()).await.unwrap();
        assert_eq!(lib.len(), 1);
        assert!(lib.by_id.contains_key("2006.10637"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = JsonPaperLibrary::open(dir.path().join("nope")).await;
        assert!(matches!(result, Err(ProviderError::IoError(_))));
    }
}
