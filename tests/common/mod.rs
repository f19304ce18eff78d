//! Shared test support: scripted transports and engine wiring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use straylight::budget::{StaticProbe, TokenBudgeter};
use straylight::client::ModelClient;
use straylight::config::{RequestConfig, RetryConfig, StraylightConfig};
use straylight::engine::{Environment, KnowledgeEngine, StoreTarget};
use straylight::providers::{
    ChatTransport, TokenUsage, TransportError, TransportRequest, TransportResponse,
};

/// A transport that replays a fixed sequence of replies. When the sequence
/// is exhausted it repeats the last reply, so "model that never changes its
/// mind" scenarios need only one entry.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    pub calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new<S: Into<String>>(replies: Vec<S>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn complete(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut replies = self.replies.lock().expect("lock");
            replies.pop_front()
        };
        let content = match next {
            Some(reply) => {
                *self.last.lock().expect("lock") = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .expect("lock")
                .clone()
                .ok_or_else(|| TransportError::Parse("script is empty".to_owned()))?,
        };
        Ok(TransportResponse {
            content,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
            model: request.model,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A transport that fails with transient errors before succeeding.
pub struct FlakyTransport {
    failures_left: Mutex<u32>,
    reply: String,
    pub attempts: AtomicU32,
}

impl FlakyTransport {
    pub fn new(failures: u32, reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            failures_left: Mutex::new(failures),
            reply: reply.into(),
            attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ChatTransport for FlakyTransport {
    async fn complete(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut left = self.failures_left.lock().expect("lock");
            if *left > 0 {
                *left = left.saturating_sub(1);
                return Err(TransportError::HttpStatus {
                    status: 503,
                    body: "upstream briefly unavailable".to_owned(),
                });
            }
        }
        Ok(TransportResponse {
            content: self.reply.clone(),
            usage: None,
            model: request.model,
        })
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Retry policy with negligible delays so tests stay fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        multiplier: 2.0,
    }
}

/// Build a client over any transport with an offline image probe.
pub fn make_client(transport: Arc<dyn ChatTransport>) -> Arc<ModelClient> {
    Arc::new(ModelClient::new(
        transport,
        TokenBudgeter::with_probe(Arc::new(StaticProbe(Some((512, 512))))),
        fast_retry(),
        RequestConfig::default(),
    ))
}

/// Engine plus a disposable environment over a scripted transport.
pub fn make_engine(transport: Arc<dyn ChatTransport>) -> (KnowledgeEngine, Environment) {
    let config = Arc::new(StraylightConfig::default());
    let engine = KnowledgeEngine::new(make_client(transport), config);
    let env = engine
        .create_env(StoreTarget::Disposable)
        .expect("disposable env");
    (engine, env)
}

/// A tiny two-page document fixture used across engine and QA tests.
pub fn fixture_document() -> straylight::types::Document {
    use straylight::types::{
        Document, HeadingLevel, Page, PageNode, ParagraphKind, TocEntry, TocLevel,
    };
    Document {
        id: "contract-a".to_owned(),
        pages: vec![
            Page {
                index: 0,
                nodes: vec![
                    PageNode::Section {
                        id: "s-pay".to_owned(),
                        parent_id: None,
                        description: "Payment terms".to_owned(),
                    },
                    PageNode::Heading {
                        id: "h-pay".to_owned(),
                        parent_id: Some("s-pay".to_owned()),
                        level: HeadingLevel::H2,
                        content: "Payment".to_owned(),
                    },
                    PageNode::Paragraph {
                        id: "p-pay".to_owned(),
                        parent_id: Some("s-pay".to_owned()),
                        level: ParagraphKind::Paragraph,
                        content: "Invoices are payable net thirty (30) days from receipt."
                            .to_owned(),
                        continuation: false,
                    },
                ],
            },
            Page {
                index: 1,
                nodes: vec![
                    PageNode::Section {
                        id: "s-term".to_owned(),
                        parent_id: None,
                        description: "Termination".to_owned(),
                    },
                    PageNode::Paragraph {
                        id: "p-term".to_owned(),
                        parent_id: Some("s-term".to_owned()),
                        level: ParagraphKind::Paragraph,
                        content: "Either party may terminate on sixty (60) days written notice."
                            .to_owned(),
                        continuation: false,
                    },
                ],
            },
        ],
        toc: vec![
            TocEntry {
                id: "t-pay".to_owned(),
                parent_id: None,
                title: "Payment".to_owned(),
                description: Some("Payment terms".to_owned()),
                target_page: Some(0),
                target_section_id: Some("s-pay".to_owned()),
                level: TocLevel::L1,
            },
            TocEntry {
                id: "t-term".to_owned(),
                parent_id: None,
                title: "Termination".to_owned(),
                description: Some("Termination rights".to_owned()),
                target_page: Some(1),
                target_section_id: Some("s-term".to_owned()),
                level: TocLevel::L1,
            },
        ],
    }
}
