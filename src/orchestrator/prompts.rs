//! Prompt construction for the three agents, plain chat, and session query planning.

use crate::llm::{ChatMessage, CompletionRequest, ResponseFormat};
use crate::models::{ConversationTurn, EvidenceBundle, RetrievedPassage, Role, WebResult};

const PLANNER_SYSTEM: &str = "You are a research planner. You write short, targeted web search \
queries that fill the gaps left by what the local papers already say.";

const ANALYST_SYSTEM: &str = "You are an insightful academic research analyst. Combine the evidence \
you are given, reason carefully, and write clear, structured Markdown.

Rules:
- Use short subtitles for each theme.
- Support every claim with the marker of its source, e.g. [P1] for a local paper passage or [W2] for a web result.
- Only use markers that appear in the evidence.
- If sources contradict each other, say so explicitly.
- If the evidence is thin, reason cautiously and state the uncertainty.
- Use bullet points when comparing ideas.";

const SCOUT_SYSTEM: &str = "You write concise, varied search queries for academic paper databases.";

const CHAT_PLANNER_SYSTEM: &str = "You write short web search queries that would help answer a \
user's message.";

const CHAT_SYSTEM: &str = "You are a helpful research assistant. Answer conversationally and \
concisely. When web results are provided, ground the answer in them.";

/// Request for 1..=`max_queries` web queries, as JSON.
pub fn expansion_request(
    question: &str,
    passages: &[RetrievedPassage],
    max_queries: usize,
    context_chars: usize,
    strict: bool,
) -> CompletionRequest {
    let context = if passages.is_empty() {
        "No relevant passages were found in the local papers.".to_string()
    } else {
        let joined = passages
            .iter()
            .map(|p| p.section.text.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        truncate_chars(&joined, context_chars)
    };

    let mut user = format!(
        "User question: \"{question}\"\n\n\
         Found local context:\n{context}\n\n\
         Which questions should we ask a web search engine to fill in the gaps? \
         Generate between 1 and {max_queries} concise search queries. \
         Respond in JSON with a single key \"queries\" holding a list of strings."
    );
    if strict {
        user.push_str(
            "\n\nYour previous reply could not be parsed. Reply with ONLY a JSON object, \
             no prose and no code fences, exactly of the form {\"queries\": [\"first query\", \"second query\"]}.",
        );
    }

    CompletionRequest::new(PLANNER_SYSTEM, user).with_format(ResponseFormat::Json)
}

/// Request for 1..=`max_queries` paper-discovery queries for a research topic, as JSON.
pub fn discovery_request(topic: &str, max_queries: usize) -> CompletionRequest {
    let user = format!(
        "Research topic: \"{topic}\"\n\n\
         Generate between 1 and {max_queries} different search queries that together cover \
         the most relevant papers on this topic. \
         Respond in JSON with a single key \"queries\" holding a list of strings."
    );
    CompletionRequest::new(SCOUT_SYSTEM, user).with_format(ResponseFormat::Json)
}

/// Request for 1..=`max_queries` web queries that help answer a chat message, as JSON.
pub fn chat_queries_request(message: &str, max_queries: usize) -> CompletionRequest {
    let user = format!(
        "User message: \"{message}\"\n\n\
         Generate between 1 and {max_queries} web search queries whose results would help \
         answer it. \
         Respond in JSON with a single key \"queries\" holding a list of strings."
    );
    CompletionRequest::new(CHAT_PLANNER_SYSTEM, user).with_format(ResponseFormat::Json)
}

/// Request for the final Markdown answer over the gathered evidence.
pub fn synthesis_request(bundle: &EvidenceBundle, passage_chars: usize) -> CompletionRequest {
    let mut user = format!("**User's question:** \"{}\"\n\n---\n**Local papers:**\n", bundle.question);

    if bundle.passages.is_empty() {
        user.push_str("No relevant passages were found in the local knowledge base.\n");
    } else {
        for (i, passage) in bundle.passages.iter().enumerate() {
            user.push_str(&format_passage(i + 1, passage, passage_chars));
        }
    }

    user.push_str("\n---\n**Web results:**\n");
    if bundle.web_results.is_empty() {
        user.push_str("No relevant web results were found.\n");
    } else {
        for (i, result) in bundle.web_results.iter().enumerate() {
            user.push_str(&format_web_result(i + 1, result));
        }
    }

    CompletionRequest::new(ANALYST_SYSTEM, user)
}

/// Request for a chat reply given the recent history and optional web hits.
pub fn chat_request(history: &[ConversationTurn], message: &str, web: &[WebResult]) -> CompletionRequest {
    let mut messages = vec![ChatMessage::system(CHAT_SYSTEM)];
    for turn in history {
        messages.push(match turn.role {
            Role::User => ChatMessage::user(turn.content.clone()),
            Role::Assistant => ChatMessage::assistant(turn.content.clone()),
        });
    }

    let mut user = message.to_string();
    if !web.is_empty() {
        user.push_str("\n\n---\nWeb search results:\n");
        for (i, result) in web.iter().enumerate() {
            user.push_str(&format_web_result(i + 1, result));
        }
    }
    messages.push(ChatMessage::user(user));

    CompletionRequest {
        messages,
        format: ResponseFormat::Text,
    }
}

fn format_passage(index: usize, passage: &RetrievedPassage, max_chars: usize) -> String {
    let section = &passage.section;
    format!(
        "[P{index}] {} ({}) | section: {} | {}\n{}\n\n",
        section.paper_title,
        section.key.paper_id,
        section.key.section_name,
        section.paper_url,
        truncate_chars(section.text.trim(), max_chars)
    )
}

fn format_web_result(index: usize, result: &WebResult) -> String {
    format!("[W{index}] {} | {}\n{}\n\n", result.title, result.url, result.snippet)
}

/// Cut `text` to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}
