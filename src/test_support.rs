//! Stub collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AppConfig, PipelineConfig, RetryConfig};
use crate::error::PipelineError;
use crate::pipeline::filter::FilterRules;
use crate::pipeline::{Collaborators, Guards};
use crate::providers::{
    MailMessage, MailProvider, OutgoingReply, SentReply, Summarizer, Summary, SummaryMetadata,
};
use crate::store::accounts::InMemoryAccounts;
use crate::store::memory::InMemoryMessageStore;
use crate::store::traits::UserProfile;

pub fn message(id: &str, sender: &str, subject: &str, body: &str) -> MailMessage {
    MailMessage {
        id: id.into(),
        thread_id: format!("thread-{id}"),
        sender: sender.into(),
        sender_name: None,
        subject: subject.into(),
        body: body.into(),
        rfc822_message_id: Some(format!("<{id}@mail.example.com>")),
        received_at: None,
    }
}

pub fn profile(user_id: &str, credits: i64) -> UserProfile {
    UserProfile {
        user_id: user_id.into(),
        email_address: format!("{user_id}@example.com"),
        bot_enabled: true,
        credits_remaining: credits,
        filters: FilterRules::default(),
    }
}

/// Scriptable mailbox shared by every user.
#[derive(Default)]
pub struct StubMail {
    pub messages: Mutex<HashMap<String, MailMessage>>,
    /// Listing order of candidate ids.
    pub order: Mutex<Vec<String>>,
    pub fail_list: AtomicBool,
    /// Users whose listing fails.
    pub fail_list_for: Mutex<HashSet<String>>,
    pub fail_get: Mutex<HashSet<String>>,
    pub fail_send: AtomicBool,
    pub fail_mark_read: AtomicBool,
    /// Every call answers as if the token was revoked.
    pub reject_credentials: AtomicBool,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub sent: Mutex<Vec<OutgoingReply>>,
    pub marked_read: Mutex<Vec<String>>,
    pub queries: Mutex<Vec<String>>,
    /// Sleep inside `get_message` so concurrent callers overlap.
    pub get_delay: Mutex<Option<Duration>>,
}

fn rejected() -> PipelineError {
    PipelineError::Authentication {
        provider: "stub-mail".into(),
        reason: "401 Unauthorized".into(),
    }
}

impl StubMail {
    pub fn with_messages(messages: Vec<MailMessage>) -> Self {
        let stub = Self::default();
        for m in messages {
            stub.add(m);
        }
        stub
    }

    pub fn add(&self, m: MailMessage) {
        self.order.lock().unwrap().push(m.id.clone());
        self.messages.lock().unwrap().insert(m.id.clone(), m);
    }
}

#[async_trait]
impl MailProvider for StubMail {
    fn name(&self) -> &str {
        "stub-mail"
    }

    async fn list_candidate_ids(
        &self,
        user_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, PipelineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        if self.fail_list.load(Ordering::SeqCst)
            || self.fail_list_for.lock().unwrap().contains(user_id)
        {
            return Err(PipelineError::ProviderApi {
                provider: "stub-mail".into(),
                status: Some(400),
                reason: "list failed".into(),
            });
        }
        let order = self.order.lock().unwrap();
        Ok(order.iter().take(max_results as usize).cloned().collect())
    }

    async fn get_message(
        &self,
        _user_id: &str,
        message_id: &str,
    ) -> Result<MailMessage, PipelineError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        if self.fail_get.lock().unwrap().contains(message_id) {
            return Err(PipelineError::ProviderApi {
                provider: "stub-mail".into(),
                status: Some(500),
                reason: format!("cannot fetch {message_id}"),
            });
        }
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("message", message_id))
    }

    async fn send_reply(
        &self,
        _user_id: &str,
        reply: &OutgoingReply,
    ) -> Result<SentReply, PipelineError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(PipelineError::provider("stub-mail", "send failed"));
        }
        self.sent.lock().unwrap().push(reply.clone());
        Ok(SentReply {
            id: format!("sent-{}", reply.thread_id),
            thread_id: Some(reply.thread_id.clone()),
        })
    }

    async fn mark_read(&self, _user_id: &str, message_id: &str) -> Result<(), PipelineError> {
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(PipelineError::provider("stub-mail", "modify failed"));
        }
        self.marked_read.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubSummarizer {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for StubSummarizer {
    fn name(&self) -> &str {
        "stub-ai"
    }

    async fn summarize(
        &self,
        _content: &str,
        metadata: &SummaryMetadata,
    ) -> Result<Summary, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::ProviderApi {
                provider: "stub-ai".into(),
                status: Some(400),
                reason: "model refused".into(),
            });
        }
        Ok(Summary {
            summary: format!("Summary of {}", metadata.subject),
            keywords: vec!["alpha".into(), "beta".into()],
            action_items: vec!["Reply by Friday".into()],
        })
    }
}

/// Everything a pipeline test needs, wired with in-memory stores.
pub struct Fixture {
    pub accounts: Arc<InMemoryAccounts>,
    pub messages: Arc<InMemoryMessageStore>,
    pub mail: Arc<StubMail>,
    pub summarizer: Arc<StubSummarizer>,
    pub collaborators: Collaborators,
    pub guards: Guards,
    pub config: PipelineConfig,
}

impl Fixture {
    pub async fn new(users: Vec<UserProfile>, mail: StubMail) -> Self {
        let accounts = Arc::new(InMemoryAccounts::new());
        for u in users {
            accounts.insert(u).await;
        }
        let messages = Arc::new(InMemoryMessageStore::new());
        let mail = Arc::new(mail);
        let summarizer = Arc::new(StubSummarizer::default());

        let collaborators = Collaborators {
            users: accounts.clone(),
            messages: messages.clone(),
            ledger: accounts.clone(),
            mail: mail.clone(),
            summarizer: summarizer.clone(),
            connections: accounts.clone(),
        };

        let mut app = AppConfig::default();
        app.retry = RetryConfig {
            max_attempts: 2,
            base: 2.0,
            unit: Duration::from_millis(1),
        };
        let guards = Guards::from_config(&app);

        Self {
            accounts,
            messages,
            mail,
            summarizer,
            collaborators,
            guards,
            config: PipelineConfig::default(),
        }
    }
}
