//! Rule Store Interface: read membership, append one entry, surface a
//! commit identifier. Consumed, not owned, by the classifier.

use async_trait::async_trait;
use base64::Engine;

/// Whether `domain` is already covered by the store, and which line (if
/// any) covers it. A suffix-covering ancestor line counts as coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub covered: bool,
    pub matched_line: Option<String>,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn contains(&self, domain: &str) -> Result<Membership, crate::error::ClassifyError>;

    async fn append(
        &self,
        domain: &str,
        author_identity: &str,
    ) -> Result<String, crate::error::ClassifyError>;
}

fn is_ancestor_or_self(domain: &str, line: &str) -> bool {
    domain == line || domain.ends_with(&format!(".{line}"))
}

/// In-process store over a line list, for tests and local runs without a
/// real upstream repository.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    lines: parking_lot::RwLock<Vec<String>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            lines: parking_lot::RwLock::new(lines.into_iter().collect()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.read().clone()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn contains(&self, domain: &str) -> Result<Membership, crate::error::ClassifyError> {
        let lines = self.lines.read();
        let matched = lines.iter().find(|line| is_ancestor_or_self(domain, line));
        Ok(Membership {
            covered: matched.is_some(),
            matched_line: matched.cloned(),
        })
    }

    async fn append(
        &self,
        domain: &str,
        _author_identity: &str,
    ) -> Result<String, crate::error::ClassifyError> {
        let mut lines = self.lines.write();
        lines.push(domain.to_string());
        Ok(format!("memory-{}", lines.len()))
    }
}

/// GitHub Contents API-backed store: reads the rule file, appends a line,
/// and commits via a single PUT with the prior blob's `sha`.
pub struct GitHubRuleStore {
    client: reqwest::Client,
    repo: String,
    path: String,
    token: String,
    author_email: String,
}

#[derive(Debug, serde::Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
}

#[derive(Debug, serde::Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    sha: &'a str,
    committer: Committer<'a>,
}

#[derive(Debug, serde::Serialize)]
struct Committer<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct PutContentsResponse {
    commit: CommitRef,
}

#[derive(Debug, serde::Deserialize)]
struct CommitRef {
    sha: String,
}

impl GitHubRuleStore {
    pub fn new(repo: impl Into<String>, path: impl Into<String>, token: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            repo: repo.into(),
            path: path.into(),
            token: token.into(),
            author_email: author_email.into(),
        }
    }

    fn contents_url(&self) -> String {
        format!("https://api.github.com/repos/{}/contents/{}", self.repo, self.path)
    }

    async fn fetch(&self) -> Result<ContentsResponse, crate::error::ClassifyError> {
        let resp = self
            .client
            .get(self.contents_url())
            .header(reqwest::header::USER_AGENT, "rule-bot")
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(crate::error::ClassifyError::RuleStoreError(format!(
                "GitHub contents fetch failed: {}",
                resp.status()
            )));
        }

        resp.json::<ContentsResponse>()
            .await
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))
    }

    fn decode_lines(body: &ContentsResponse) -> Result<Vec<String>, crate::error::ClassifyError> {
        let cleaned: String = body.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl RuleStore for GitHubRuleStore {
    async fn contains(&self, domain: &str) -> Result<Membership, crate::error::ClassifyError> {
        let body = self.fetch().await?;
        let lines = Self::decode_lines(&body)?;
        let matched = lines.into_iter().find(|line| is_ancestor_or_self(domain, line));
        Ok(Membership {
            covered: matched.is_some(),
            matched_line: matched,
        })
    }

    async fn append(
        &self,
        domain: &str,
        author_identity: &str,
    ) -> Result<String, crate::error::ClassifyError> {
        let current = self.fetch().await?;
        let mut lines = Self::decode_lines(&current)?;
        lines.push(domain.to_string());
        let mut new_text = lines.join("\n");
        new_text.push('\n');
        let encoded = base64::engine::general_purpose::STANDARD.encode(new_text);

        let req = PutContentsRequest {
            message: &format!("Add {domain} to direct list"),
            content: encoded,
            sha: &current.sha,
            committer: Committer {
                name: "Rule-Bot",
                email: author_identity,
            },
        };

        let resp = self
            .client
            .put(self.contents_url())
            .header(reqwest::header::USER_AGENT, "rule-bot")
            .bearer_auth(&self.token)
            .json(&req)
            .send()
            .await
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(crate::error::ClassifyError::RuleStoreError(format!(
                "GitHub contents commit failed: {}",
                resp.status()
            )));
        }

        let parsed: PutContentsResponse = resp
            .json()
            .await
            .map_err(|e| crate::error::ClassifyError::RuleStoreError(e.to_string()))?;
        Ok(parsed.commit.sha)
    }
}
