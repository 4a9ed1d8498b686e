use answerpipe_core::{
    CompletedWorkflow, Error, PersistedPayload, Result, WebResearchSource, WorkflowEvent,
    WorkflowStage,
};
use answerpipe_research::signer::PersistenceSigner;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bounded so a slow client applies backpressure to the pipeline instead of
/// buffering unboundedly.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    Started,
    Researching,
    Synthesizing,
    Finalizing,
    Persisted,
    Closed,
    Errored,
}

/// The protocol state machine. Owns the producing side of the event channel
/// and refuses out-of-order emissions; the consuming side closing (client
/// disconnect) surfaces as [`Error::Cancelled`] at the next send, which is
/// the signal to stop doing work.
pub struct WorkflowEmitter {
    tx: mpsc::Sender<WorkflowEvent>,
    state: EmitterState,
    workflow_id: Option<Uuid>,
    nonce: Option<Uuid>,
}

impl WorkflowEmitter {
    pub fn new(tx: mpsc::Sender<WorkflowEvent>) -> Self {
        Self {
            tx,
            state: EmitterState::Idle,
            workflow_id: None,
            nonce: None,
        }
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    pub fn workflow_id(&self) -> Option<Uuid> {
        self.workflow_id
    }

    pub fn nonce(&self) -> Option<Uuid> {
        self.nonce
    }

    fn out_of_order(&self, event: &str) -> Error {
        Error::Stream(format!("{event} not allowed in state {:?}", self.state))
    }

    async fn send(&mut self, ev: WorkflowEvent) -> Result<()> {
        if self.tx.send(ev).await.is_err() {
            self.state = EmitterState::Closed;
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// `Idle → Started`; mints the workflow id and nonce exactly once.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != EmitterState::Idle {
            return Err(self.out_of_order("workflow_start"));
        }
        let workflow_id = Uuid::now_v7();
        let nonce = Uuid::now_v7();
        self.workflow_id = Some(workflow_id);
        self.nonce = Some(nonce);
        self.send(WorkflowEvent::WorkflowStart { workflow_id, nonce })
            .await?;
        self.state = EmitterState::Started;
        Ok(())
    }

    fn streaming_allowed(&self) -> bool {
        matches!(
            self.state,
            EmitterState::Started | EmitterState::Researching | EmitterState::Synthesizing
        )
    }

    pub async fn progress(
        &mut self,
        stage: WorkflowStage,
        message: impl Into<String>,
        tool_reasoning: Option<String>,
        tool_query: Option<String>,
    ) -> Result<()> {
        if !self.streaming_allowed() {
            return Err(self.out_of_order("progress"));
        }
        self.send(WorkflowEvent::Progress {
            stage,
            message: message.into(),
            tool_reasoning,
            tool_query,
        })
        .await?;
        if self.state == EmitterState::Started {
            self.state = EmitterState::Researching;
        }
        Ok(())
    }

    pub async fn reasoning(&mut self, content: impl Into<String>) -> Result<()> {
        if !self.streaming_allowed() {
            return Err(self.out_of_order("reasoning"));
        }
        self.send(WorkflowEvent::Reasoning {
            content: content.into(),
        })
        .await?;
        self.state = EmitterState::Synthesizing;
        Ok(())
    }

    pub async fn content(&mut self, delta: impl Into<String>) -> Result<()> {
        if !self.streaming_allowed() {
            return Err(self.out_of_order("content"));
        }
        self.send(WorkflowEvent::Content {
            delta: delta.into(),
        })
        .await?;
        self.state = EmitterState::Synthesizing;
        Ok(())
    }

    /// Exactly one per workflow; requires a non-empty answer.
    pub async fn metadata(
        &mut self,
        web_research_sources: Vec<WebResearchSource>,
        has_limitations: bool,
        confidence: f64,
        answer_length: u64,
    ) -> Result<()> {
        if !self.streaming_allowed() {
            return Err(self.out_of_order("metadata"));
        }
        if answer_length == 0 {
            return Err(Error::Stream("metadata requires a non-empty answer".to_string()));
        }
        let (workflow_id, nonce) = self.ids()?;
        self.send(WorkflowEvent::Metadata {
            workflow_id,
            web_research_sources,
            has_limitations,
            confidence: confidence.clamp(0.0, 1.0),
            answer_length,
            nonce,
        })
        .await?;
        self.state = EmitterState::Finalizing;
        Ok(())
    }

    /// `Finalizing → Persisted`: one `complete`, then the payload is built,
    /// signed, self-verified, and emitted as one `persisted`. A payload that
    /// fails self-verification is dropped rather than forwarded.
    pub async fn complete_and_persist(
        &mut self,
        signer: &PersistenceSigner,
        assistant_message_id: Uuid,
        answer: String,
        web_research_sources: Vec<WebResearchSource>,
    ) -> Result<()> {
        if self.state != EmitterState::Finalizing {
            return Err(self.out_of_order("complete"));
        }
        let (workflow_id, nonce) = self.ids()?;

        self.send(WorkflowEvent::Complete {
            workflow: CompletedWorkflow {
                workflow_id,
                answer_length: answer.chars().count() as u64,
                source_count: web_research_sources.len() as u64,
            },
        })
        .await?;

        let payload = PersistedPayload {
            assistant_message_id,
            workflow_id,
            answer,
            web_research_sources,
        };
        let signature = signer.sign(&payload, &nonce)?;
        if !signer.verify(&payload, &nonce, &signature) {
            tracing::error!(
                workflow_id = %workflow_id,
                "signature failed self-verification; dropping persisted event"
            );
            self.state = EmitterState::Persisted;
            return Ok(());
        }

        self.send(WorkflowEvent::Persisted {
            payload,
            nonce,
            signature,
        })
        .await?;
        self.state = EmitterState::Persisted;
        Ok(())
    }

    /// Terminal failure: one `error` event, best effort, from any non-terminal
    /// state. Content already streamed is not retracted.
    pub async fn fail(&mut self, message: impl Into<String>) {
        if matches!(
            self.state,
            EmitterState::Persisted | EmitterState::Closed | EmitterState::Errored
        ) {
            return;
        }
        let _ = self
            .tx
            .send(WorkflowEvent::Error {
                message: message.into(),
            })
            .await;
        self.state = EmitterState::Errored;
    }

    pub fn close(&mut self) {
        self.state = EmitterState::Closed;
    }

    fn ids(&self) -> Result<(Uuid, Uuid)> {
        match (self.workflow_id, self.nonce) {
            (Some(w), Some(n)) => Ok((w, n)),
            _ => Err(Error::Stream("workflow was never started".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::SourceKind;

    fn source() -> WebResearchSource {
        WebResearchSource {
            context_id: Uuid::now_v7(),
            kind: SourceKind::SearchResult,
            url: Some("https://example.com/a".to_string()),
            title: Some("A".to_string()),
            timestamp_ms: 0,
            relevance_score: Some(0.5),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn happy_path_emits_the_full_ordered_sequence() {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut em = WorkflowEmitter::new(tx);
        let signer = PersistenceSigner::new(b"key".to_vec());

        em.start().await.unwrap();
        em.progress(WorkflowStage::Searching, "searching", None, None)
            .await
            .unwrap();
        em.reasoning("thinking").await.unwrap();
        em.content("answer text").await.unwrap();
        em.metadata(vec![source()], false, 0.9, 11).await.unwrap();
        em.complete_and_persist(&signer, Uuid::now_v7(), "answer text".to_string(), vec![source()])
            .await
            .unwrap();
        assert_eq!(em.state(), EmitterState::Persisted);

        let events = drain(&mut rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types[0], "workflow_start");
        let meta = types.iter().position(|t| *t == "metadata").unwrap();
        let complete = types.iter().position(|t| *t == "complete").unwrap();
        let persisted = types.iter().position(|t| *t == "persisted").unwrap();
        assert!(meta < complete && complete < persisted);

        // One nonce binds start, metadata, and persisted.
        let nonce = em.nonce().unwrap();
        for ev in &events {
            match ev {
                WorkflowEvent::WorkflowStart { nonce: n, .. }
                | WorkflowEvent::Metadata { nonce: n, .. }
                | WorkflowEvent::Persisted { nonce: n, .. } => assert_eq!(*n, nonce),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn events_before_start_are_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let mut em = WorkflowEmitter::new(tx);
        assert!(em.content("nope").await.is_err());
        assert!(em.metadata(vec![], false, 0.5, 1).await.is_err());
    }

    #[tokio::test]
    async fn metadata_rejects_an_empty_answer() {
        let (tx, _rx) = mpsc::channel(4);
        let mut em = WorkflowEmitter::new(tx);
        em.start().await.unwrap();
        let err = em.metadata(vec![], false, 0.5, 0).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[tokio::test]
    async fn second_metadata_and_early_complete_are_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let mut em = WorkflowEmitter::new(tx);
        let signer = PersistenceSigner::new(b"key".to_vec());

        em.start().await.unwrap();
        assert!(em
            .complete_and_persist(&signer, Uuid::now_v7(), "a".to_string(), vec![])
            .await
            .is_err());

        em.metadata(vec![], false, 0.5, 1).await.unwrap();
        assert!(em.metadata(vec![], false, 0.5, 1).await.is_err());
        assert!(em.content("late").await.is_err());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_without_persisting() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut em = WorkflowEmitter::new(tx);
        let err = em.start().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(em.state(), EmitterState::Closed);
    }

    #[tokio::test]
    async fn fail_emits_one_error_and_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut em = WorkflowEmitter::new(tx);
        em.start().await.unwrap();
        em.fail("boom").await;
        em.fail("boom again").await;
        assert_eq!(em.state(), EmitterState::Errored);

        let events = drain(&mut rx).await;
        let errors = events
            .iter()
            .filter(|e| e.event_type() == "error")
            .count();
        assert_eq!(errors, 1);
        assert!(!events.iter().any(|e| e.event_type() == "persisted"));
    }
}
