//! Operator checkpoints.
//!
//! A [`Checkpoint`] is a structured precondition the bench operator must
//! confirm before the run continues: a vacuum filtration, an incubation, a
//! visual bubble check. Only the sequencer creates them. [`CheckpointGate`]
//! hands each one to an [`Operator`] and waits; there is no timeout.
//!
//! Operators:
//! - [`ConsoleOperator`] prompts on stdout and waits for Enter.
//! - [`ChannelOperator`] forwards requests over a tokio channel so another
//!   task (a UI, a test harness) can answer them.
//! - [`AutoAcknowledge`] confirms immediately and keeps a log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{AssayError, AssayResult};
use crate::stage::AssayStage;

/// What the operator has to do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Vacuum the filter plate after the prewet.
    PlateVacuum,
    /// Inspect the tips for bubbles before dispensing.
    BubbleCheck,
    /// Load the vortexed beads into the reservoir.
    BeadLoading,
    /// Vacuum between wash iterations.
    WashVacuum,
    /// Seal, shake, incubate.
    Incubation,
    /// Vacuum ahead of the final wash.
    PreWashVacuum,
}

impl CheckpointKind {
    /// Lower-case label for prompts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::PlateVacuum => "plate vacuum",
            CheckpointKind::BubbleCheck => "bubble check",
            CheckpointKind::BeadLoading => "bead loading",
            CheckpointKind::WashVacuum => "wash vacuum",
            CheckpointKind::Incubation => "incubation",
            CheckpointKind::PreWashVacuum => "pre-wash vacuum",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `current` of `total`, both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// This step.
    pub current: u32,
    /// Steps in the loop.
    pub total: u32,
}

/// A pause the operator has to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    stage: AssayStage,
    kind: CheckpointKind,
    message: String,
    progress: Option<Progress>,
    terminal: bool,
}

impl Checkpoint {
    pub(crate) fn new(stage: AssayStage, kind: CheckpointKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            progress: None,
            terminal: false,
        }
    }

    pub(crate) fn with_progress(mut self, current: u32, total: u32) -> Self {
        self.progress = Some(Progress { current, total });
        self
    }

    /// Mark as the last gate of its stage.
    pub(crate) fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Stage that opened the gate.
    pub fn stage(&self) -> AssayStage {
        self.stage
    }

    /// What the operator has to do.
    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    /// Instruction shown to the operator.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Position within a repeated loop, if any.
    pub fn progress(&self) -> Option<Progress> {
        self.progress
    }

    /// Whether passing this gate ends the stage.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[step {} · {}]", self.stage.number(), self.kind)?;
        if let Some(p) = self.progress {
            write!(f, " ({}/{})", p.current, p.total)?;
        }
        write!(f, " {}", self.message)
    }
}

/// Whoever answers checkpoints.
#[async_trait]
pub trait Operator: Send {
    /// Block until the operator confirms. An error aborts the run.
    async fn acknowledge(&mut self, checkpoint: &Checkpoint) -> AssayResult<()>;

    /// Non-blocking progress note.
    fn comment(&mut self, message: &str);
}

/// One answered gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateRecord {
    /// The gate that was passed.
    pub checkpoint: Checkpoint,
    /// When the gate was opened.
    pub opened_at: DateTime<Utc>,
    /// When the operator answered.
    pub acknowledged_at: DateTime<Utc>,
}

/// Opens checkpoints against an operator and keeps the history.
pub struct CheckpointGate<O> {
    operator: O,
    history: Vec<GateRecord>,
    notes: Vec<String>,
}

impl<O: Operator> CheckpointGate<O> {
    /// Gate with empty history.
    pub fn new(operator: O) -> Self {
        Self {
            operator,
            history: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Wait for the operator to confirm `checkpoint`.
    pub async fn wait(&mut self, checkpoint: Checkpoint) -> AssayResult<()> {
        let opened_at = Utc::now();
        info!(
            stage = %checkpoint.stage(),
            kind = %checkpoint.kind(),
            terminal = checkpoint.is_terminal(),
            "Checkpoint: {}",
            checkpoint.message()
        );
        self.operator.acknowledge(&checkpoint).await?;
        self.history.push(GateRecord {
            checkpoint,
            opened_at,
            acknowledged_at: Utc::now(),
        });
        Ok(())
    }

    /// Log `message` and pass it to the operator without waiting.
    pub fn notify(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.operator.comment(&message);
        self.notes.push(message);
    }

    /// Answered gates, oldest first.
    pub fn history(&self) -> &[GateRecord] {
        &self.history
    }

    /// Every notification sent so far.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Whether the terminal gate of `stage` has been passed.
    pub fn terminal_acknowledged(&self, stage: AssayStage) -> bool {
        self.history
            .iter()
            .any(|r| r.checkpoint.stage() == stage && r.checkpoint.is_terminal())
    }

    /// The operator answering this gate.
    pub fn operator(&self) -> &O {
        &self.operator
    }
}

/// Prompts on stdout and reads a line from stdin.
///
/// An empty line continues. `abort` (or a closed stdin) stops the run.
pub struct ConsoleOperator {
    lines: Lines<BufReader<Stdin>>,
}

impl ConsoleOperator {
    /// Read answers from the process stdin.
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn acknowledge(&mut self, checkpoint: &Checkpoint) -> AssayResult<()> {
        let mut stdout = tokio::io::stdout();
        let prompt = format!("\n⏸  {checkpoint}\n   Press Enter to resume, or type 'abort': ");
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        match self.lines.next_line().await? {
            Some(line) if line.trim().eq_ignore_ascii_case("abort") => Err(
                AssayError::OperatorAbort(format!("aborted at {}", checkpoint.kind())),
            ),
            Some(_) => Ok(()),
            None => Err(AssayError::OperatorAbort("console input closed".into())),
        }
    }

    fn comment(&mut self, message: &str) {
        println!("» {message}");
    }
}

/// The operator's answer to a forwarded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Continue the run.
    Proceed,
    /// Stop the run with this reason.
    Abort(String),
}

/// What a [`ChannelOperator`] sends to its counterpart.
#[derive(Debug)]
pub enum OperatorEvent {
    /// A gate waiting for an answer.
    Checkpoint {
        /// The gate being opened.
        checkpoint: Checkpoint,
        /// Send exactly one answer here; dropping it aborts the run.
        response: oneshot::Sender<Acknowledgement>,
    },
    /// A progress note; no answer expected.
    Comment(String),
}

/// Forwards checkpoints to another task and waits for its answer.
///
/// A dropped receiver or response sender counts as an abort.
pub struct ChannelOperator {
    tx: mpsc::Sender<OperatorEvent>,
}

impl ChannelOperator {
    /// Operator plus the receiving end for whoever answers.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperatorEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Operator for ChannelOperator {
    async fn acknowledge(&mut self, checkpoint: &Checkpoint) -> AssayResult<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(OperatorEvent::Checkpoint {
                checkpoint: checkpoint.clone(),
                response,
            })
            .await
            .map_err(|_| AssayError::OperatorAbort("operator channel closed".into()))?;

        match rx.await {
            Ok(Acknowledgement::Proceed) => Ok(()),
            Ok(Acknowledgement::Abort(reason)) => Err(AssayError::OperatorAbort(reason)),
            Err(_) => Err(AssayError::OperatorAbort(
                "operator dropped the checkpoint".into(),
            )),
        }
    }

    fn comment(&mut self, message: &str) {
        if let Err(e) = self.tx.try_send(OperatorEvent::Comment(message.to_string())) {
            warn!("Operator comment not delivered: {e}");
        }
    }
}

/// Confirms every checkpoint at once and records everything it sees.
#[derive(Debug, Default)]
pub struct AutoAcknowledge {
    checkpoints: Vec<Checkpoint>,
    comments: Vec<String>,
    refuse: Option<CheckpointKind>,
}

impl AutoAcknowledge {
    /// Acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort on the first checkpoint of `kind`.
    pub fn refusing(kind: CheckpointKind) -> Self {
        Self {
            refuse: Some(kind),
            ..Self::default()
        }
    }

    /// Checkpoints acknowledged so far.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Notifications received so far.
    pub fn comments(&self) -> &[String] {
        &self.comments
    }
}

#[async_trait]
impl Operator for AutoAcknowledge {
    async fn acknowledge(&mut self, checkpoint: &Checkpoint) -> AssayResult<()> {
        if self.refuse == Some(checkpoint.kind()) {
            return Err(AssayError::OperatorAbort(format!(
                "refused {}",
                checkpoint.kind()
            )));
        }
        self.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    fn comment(&mut self, message: &str) {
        self.comments.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vacuum(i: u32) -> Checkpoint {
        Checkpoint::new(
            AssayStage::WashAndDetectionAntibody,
            CheckpointKind::WashVacuum,
            "Vacuum the plate",
        )
        .with_progress(i, 4)
    }

    #[tokio::test]
    async fn test_gate_records_history() {
        let mut gate = CheckpointGate::new(AutoAcknowledge::new());
        gate.wait(vacuum(1)).await.unwrap();
        gate.notify("washed");
        gate.wait(
            Checkpoint::new(
                AssayStage::WashAndDetectionAntibody,
                CheckpointKind::Incubation,
                "Incubate 60 min",
            )
            .terminal(),
        )
        .await
        .unwrap();

        assert_eq!(gate.history().len(), 2);
        assert!(gate.history()[0].acknowledged_at >= gate.history()[0].opened_at);
        assert_eq!(gate.notes(), &["washed".to_string()]);
        assert_eq!(gate.operator().comments().len(), 1);
        assert!(gate.terminal_acknowledged(AssayStage::WashAndDetectionAntibody));
        assert!(!gate.terminal_acknowledged(AssayStage::StreptavidinPe));
    }

    #[tokio::test]
    async fn test_refusal_aborts() {
        let mut gate = CheckpointGate::new(AutoAcknowledge::refusing(CheckpointKind::WashVacuum));
        let err = gate.wait(vacuum(1)).await.unwrap_err();
        assert!(matches!(err, AssayError::OperatorAbort(_)));
        assert!(gate.history().is_empty());
    }

    #[tokio::test]
    async fn test_channel_operator_round_trip() {
        let (operator, mut rx) = ChannelOperator::new(4);
        let harness = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    OperatorEvent::Checkpoint {
                        checkpoint,
                        response,
                    } => {
                        let answer = if checkpoint.progress().map(|p| p.current) == Some(2) {
                            Acknowledgement::Abort("filter clogged".into())
                        } else {
                            Acknowledgement::Proceed
                        };
                        seen.push(checkpoint.kind());
                        let _ = response.send(answer);
                    }
                    OperatorEvent::Comment(_) => {}
                }
            }
            seen
        });

        let mut gate = CheckpointGate::new(operator);
        gate.wait(vacuum(1)).await.unwrap();
        let err = gate.wait(vacuum(2)).await.unwrap_err();
        assert!(err.to_string().contains("filter clogged"));
        drop(gate);

        let seen = harness.await.unwrap();
        assert_eq!(seen, vec![CheckpointKind::WashVacuum; 2]);
    }

    #[tokio::test]
    async fn test_channel_operator_closed() {
        let (operator, rx) = ChannelOperator::new(1);
        drop(rx);
        let mut gate = CheckpointGate::new(operator);
        assert!(matches!(
            gate.wait(vacuum(1)).await,
            Err(AssayError::OperatorAbort(_))
        ));
    }

    #[test]
    fn test_display_includes_progress() {
        let text = vacuum(3).to_string();
        assert!(text.contains("step 2"));
        assert!(text.contains("(3/4)"));
    }
}
