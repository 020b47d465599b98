//! Prompt assembly for retrieval-augmented chat.
//!
//! Builds the message list sent to the completion endpoint:
//!
//! ```text
//! system     persona + citation policy, with {context} substituted
//! user/asst  prior session history (oldest first)
//! user       current query
//! ```
//!
//! The citation policy asks the model to attribute claims as
//! `[NOME_DO_ARQUIVO]`. Nothing downstream checks that it complied.

use serde::{Deserialize, Serialize};

use crate::models::{Message, Role, SearchHit};

/// Placeholder replaced by the formatted context in the system template.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

/// Default persona: a Brasília tourism guide answering from the documents.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "Você é um guia turístico simpático, detalhista e especializado em Brasília. Use o conteúdo abaixo para responder perguntas dos visitantes com clareza e entusiasmo:

{context}

Se o contexto não for relevante para a pergunta, diga que não há informações disponíveis nos documentos. Sempre cite a fonte usando [NOME_DO_ARQUIVO] ao final da frase relevante.";

/// Context used when retrieval fails or finds nothing.
pub const NO_CONTEXT: &str = "Nenhum contexto encontrado.";

/// Assistant message recorded when synthesis fails.
pub const APOLOGY: &str = "Desculpe, ocorreu um erro interno.";

/// One message in the wire format of OpenAI-compatible chat APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        match m.role {
            Role::Human => ChatMessage::user(m.content.clone()),
            Role::Assistant => ChatMessage::assistant(m.content.clone()),
        }
    }
}

/// Format retrieved hits as a ranked, source-attributed list.
///
/// Returns [`NO_CONTEXT`] when there are no hits.
pub fn format_context(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_CONTEXT.to_string();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let source = if hit.source.is_empty() {
            "Fonte desconhecida"
        } else {
            hit.source.as_str()
        };
        out.push_str(&format!("**Fonte {} ({})**: {}\n\n", i + 1, source, hit.chunk.text));
    }
    out
}

/// Assemble the full message list for one turn.
///
/// `history` must not include the current query; it is appended last.
pub fn build_messages(
    template: &str,
    context: &str,
    history: &[Message],
    query: &str,
) -> Vec<ChatMessage> {
    let system = if template.contains(CONTEXT_PLACEHOLDER) {
        template.replace(CONTEXT_PLACEHOLDER, context)
    } else {
        format!("{}\n\n{}", template, context)
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(query));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn hit(source: &str, text: &str) -> SearchHit {
        SearchHit {
            chunk: Chunk {
                id: "c".into(),
                document_id: "d".into(),
                chunk_index: 0,
                text: text.into(),
                hash: "h".into(),
            },
            source: source.into(),
            score: 0.9,
        }
    }

    #[test]
    fn test_format_context_is_ranked_and_attributed() {
        let ctx = format_context(&[hit("a.md", "primeiro"), hit("b.pdf", "segundo")]);
        assert_eq!(
            ctx,
            "**Fonte 1 (a.md)**: primeiro\n\n**Fonte 2 (b.pdf)**: segundo\n\n"
        );
    }

    #[test]
    fn test_format_context_empty_uses_placeholder() {
        assert_eq!(format_context(&[]), NO_CONTEXT);
    }

    #[test]
    fn test_unknown_source_label() {
        assert!(format_context(&[hit("", "x")]).contains("Fonte desconhecida"));
    }

    #[test]
    fn test_build_messages_order() {
        let history = vec![Message::human("oi"), Message::assistant("olá!")];
        let msgs = build_messages(DEFAULT_SYSTEM_TEMPLATE, "CTX", &history, "e a Catedral?");
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[0].content.contains("CTX"));
        assert!(!msgs[0].content.contains(CONTEXT_PLACEHOLDER));
        assert_eq!(msgs[1], ChatMessage::user("oi"));
        assert_eq!(msgs[2], ChatMessage::assistant("olá!"));
        assert_eq!(msgs[3], ChatMessage::user("e a Catedral?"));
    }

    #[test]
    fn test_template_without_placeholder_appends_context() {
        let msgs = build_messages("Seja breve.", "CTX", &[], "q");
        assert_eq!(msgs[0].content, "Seja breve.\n\nCTX");
    }
}
