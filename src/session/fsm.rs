//! Conversation state machine.
//!
//! One FSM per session, driven exclusively from the session task so
//! state changes are totally ordered; observers follow the `watch`
//! channel and see a single monotonic sequence.
//!
//! ```text
//! idle ── user speech ──▸ listening ── query/response ──▸ analyzing
//!   ▲                        ▲                               │
//!   │                        │ upstream confirms          first audio
//!   │                   interrupted ◂── barge-in ──┐         │
//!   │                                              │         ▼
//!   └───────────── turn_complete ────────────── speaking ◂───┘
//! ```
//!
//! `fatal` is terminal and reachable from everywhere.
//!
//! Barge-in: while the model is speaking, client audio whose RMS stays
//! above the calibrated threshold for the configured window (default
//! 200 ms) cancels the current turn. A `turn_complete` that lands
//! within 50 ms of the trigger wins the race: the turn is recorded as
//! finished, not interrupted.
//!
//! Privacy halt: three consecutive blocked verdicts pause audio
//! forwarding entirely; two consecutive clear verdicts resume it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::media::AUDIO_FRAME_MS;

/// Consecutive blocked verdicts that trigger the privacy-wide halt.
const PRIVACY_PAUSE_AFTER_BLOCKS: u32 = 3;
/// Consecutive clear verdicts that lift the halt.
const PRIVACY_RESUME_AFTER_CLEAR: u32 = 2;
/// Window in which a completion beats a just-triggered interruption.
const TURN_COMPLETE_TIE_WINDOW: Duration = Duration::from_millis(50);

/// Conversation states. `Fatal` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Listening,
    Analyzing,
    Speaking,
    Interrupted,
    Fatal,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Analyzing => "analyzing",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Fatal => "fatal",
        }
    }
}

/// Whether `from -> to` is an edge of the machine.
pub fn legal_transition(from: ConversationState, to: ConversationState) -> bool {
    use ConversationState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Analyzing)
            | (Analyzing, Speaking)
            | (Analyzing, Idle)       // text-only turn: completes without audio
            | (Speaking, Interrupted)
            | (Speaking, Idle)
            | (Interrupted, Listening)
            | (_, Fatal)
    )
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Finished,
    Interrupted,
    Timeout,
    Error,
}

/// One upstream turn: user input accepted through response fully
/// emitted or cancelled.
#[derive(Debug)]
pub struct UpstreamTurn {
    pub id: u64,
    pub started_at: Instant,
    /// Child of the session token; cancelling the session cancels this.
    pub token: CancellationToken,
    pub completion: Option<CompletionReason>,
}

/// Inputs the session task feeds into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    /// One 20 ms ingress audio chunk with its measured RMS energy.
    UserAudio { rms: u32 },
    /// The client asked a spatial question out-of-band.
    SpatialQuery,
    /// Upstream started responding without audio yet (text delta).
    UpstreamResponseStarted,
    /// Upstream emitted an audio chunk.
    UpstreamAudio,
    /// Upstream finished its turn.
    UpstreamTurnComplete,
    /// Upstream aborted its own turn (service-side speech detection).
    UpstreamInterrupted,
    /// Explicit interrupt request from the client.
    ClientInterrupt,
    /// A privacy verdict was produced for this session's latest still.
    PrivacyVerdict { forwardable: bool },
    /// Unrecoverable upstream failure or session cancellation.
    Fatal,
}

/// Side effects the session task must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// A new upstream turn opened; its token is [`ConversationFsm::turn_token`].
    OpenTurn,
    /// Cancel the in-flight turn: signal end-of-turn upstream.
    CancelTurn,
    /// Drop any synthesized audio still queued for the client.
    FlushEgress,
    /// Privacy halt engaged: stop forwarding audio.
    AudioPaused,
    /// Privacy halt lifted: resume forwarding audio.
    AudioResumed,
    /// The machine is fatal; tear the session down.
    TearDown,
}

pub struct ConversationFsm {
    state: ConversationState,
    state_tx: watch::Sender<ConversationState>,
    session_token: CancellationToken,
    turn_seq: u64,
    turn: Option<UpstreamTurn>,
    /// Consecutive speech-energy run while the model is speaking.
    speech_run: Duration,
    interrupted_at: Option<Instant>,
    consecutive_blocked: u32,
    consecutive_clear: u32,
    privacy_paused: bool,
    interrupt_rms: u32,
    interrupt_min: Duration,
}

impl ConversationFsm {
    pub fn new(
        session_token: CancellationToken,
        interrupt_rms: u32,
        interrupt_min: Duration,
    ) -> (Self, watch::Receiver<ConversationState>) {
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        (
            Self {
                state: ConversationState::Idle,
                state_tx,
                session_token,
                turn_seq: 0,
                turn: None,
                speech_run: Duration::ZERO,
                interrupted_at: None,
                consecutive_blocked: 0,
                consecutive_clear: 0,
                privacy_paused: false,
                interrupt_rms,
                interrupt_min,
            },
            state_rx,
        )
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Cancellation token of the in-flight turn, if any.
    pub fn turn_token(&self) -> Option<CancellationToken> {
        self.turn.as_ref().map(|t| t.token.clone())
    }

    pub fn current_turn_id(&self) -> Option<u64> {
        self.turn.as_ref().map(|t| t.id)
    }

    pub fn last_completion(&self) -> Option<CompletionReason> {
        self.turn.as_ref().and_then(|t| t.completion)
    }

    /// Audio is forwarded upstream while listening or immediately after
    /// an interruption, and never during a privacy-wide halt.
    pub fn should_forward_audio(&self) -> bool {
        !self.privacy_paused
            && matches!(
                self.state,
                ConversationState::Listening | ConversationState::Interrupted
            )
    }

    pub fn privacy_paused(&self) -> bool {
        self.privacy_paused
    }

    /// Apply one event. Returns the effects the session task must run.
    pub fn apply(&mut self, event: FsmEvent, now: Instant) -> Vec<Effect> {
        use ConversationState::*;

        if self.state == Fatal {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match event {
            FsmEvent::UserAudio { rms } => match self.state {
                Idle => {
                    if rms >= self.interrupt_rms {
                        self.transition(Listening);
                        self.open_turn(now);
                        effects.push(Effect::OpenTurn);
                    }
                }
                Speaking => {
                    if rms >= self.interrupt_rms {
                        self.speech_run += Duration::from_millis(AUDIO_FRAME_MS);
                        if self.speech_run >= self.interrupt_min {
                            effects.extend(self.barge_in(now));
                        }
                    } else {
                        self.speech_run = Duration::ZERO;
                    }
                }
                _ => {}
            },

            FsmEvent::SpatialQuery => {
                if self.state == Listening {
                    self.transition(Analyzing);
                }
            }

            FsmEvent::UpstreamResponseStarted => {
                if self.state == Listening {
                    self.transition(Analyzing);
                }
            }

            FsmEvent::UpstreamAudio => match self.state {
                Listening => {
                    // Response began and produced audio in one step;
                    // observers still see both edges.
                    self.transition(Analyzing);
                    self.transition(Speaking);
                    self.speech_run = Duration::ZERO;
                }
                Analyzing => {
                    self.transition(Speaking);
                    self.speech_run = Duration::ZERO;
                }
                _ => {}
            },

            FsmEvent::UpstreamTurnComplete => match self.state {
                Speaking => {
                    self.close_turn(CompletionReason::Finished);
                    self.transition(Idle);
                }
                Analyzing => {
                    // Text-only turn.
                    self.close_turn(CompletionReason::Finished);
                    self.transition(Idle);
                }
                Interrupted => {
                    // Completion racing a fresh interruption: within the
                    // tie window the completion wins.
                    let within_window = self
                        .interrupted_at
                        .map(|at| now.duration_since(at) <= TURN_COMPLETE_TIE_WINDOW)
                        .unwrap_or(false);
                    if within_window {
                        if let Some(turn) = self.turn.as_mut() {
                            turn.completion = Some(CompletionReason::Finished);
                        }
                    }
                    self.interrupted_at = None;
                    self.transition(Listening);
                    self.open_turn(now);
                    effects.push(Effect::OpenTurn);
                }
                _ => {}
            },

            FsmEvent::UpstreamInterrupted => match self.state {
                Speaking => {
                    // The service detected barge-in before we did; it
                    // already stopped emitting, so this confirms the
                    // turn end as well.
                    if let Some(turn) = self.turn.as_ref() {
                        turn.token.cancel();
                    }
                    self.close_turn(CompletionReason::Interrupted);
                    self.transition(Interrupted);
                    effects.push(Effect::FlushEgress);
                    self.interrupted_at = None;
                    self.transition(Listening);
                    self.open_turn(now);
                    effects.push(Effect::OpenTurn);
                }
                Interrupted => {
                    self.interrupted_at = None;
                    self.transition(Listening);
                    self.open_turn(now);
                    effects.push(Effect::OpenTurn);
                }
                _ => {}
            },

            FsmEvent::ClientInterrupt => {
                if self.state == Speaking {
                    effects.extend(self.barge_in(now));
                }
            }

            FsmEvent::PrivacyVerdict { forwardable } => {
                effects.extend(self.apply_verdict(forwardable));
            }

            FsmEvent::Fatal => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.token.cancel();
                    if turn.completion.is_none() {
                        turn.completion = Some(CompletionReason::Error);
                    }
                }
                self.transition(Fatal);
                effects.push(Effect::TearDown);
            }
        }
        effects
    }

    // ── Internals ─────────────────────────────────────────────────

    fn transition(&mut self, to: ConversationState) {
        debug_assert!(
            legal_transition(self.state, to),
            "illegal transition {:?} -> {to:?}",
            self.state
        );
        tracing::debug!(from = self.state.as_str(), to = to.as_str(), "fsm transition");
        self.state = to;
        let _ = self.state_tx.send(to);
    }

    fn open_turn(&mut self, now: Instant) {
        self.turn_seq += 1;
        self.turn = Some(UpstreamTurn {
            id: self.turn_seq,
            started_at: now,
            token: self.session_token.child_token(),
            completion: None,
        });
    }

    fn close_turn(&mut self, reason: CompletionReason) {
        if let Some(turn) = self.turn.as_mut() {
            if turn.completion.is_none() {
                turn.completion = Some(reason);
            }
        }
    }

    fn barge_in(&mut self, now: Instant) -> Vec<Effect> {
        self.speech_run = Duration::ZERO;
        self.interrupted_at = Some(now);
        if let Some(turn) = self.turn.as_mut() {
            turn.token.cancel();
            turn.completion = Some(CompletionReason::Interrupted);
        }
        self.transition(ConversationState::Interrupted);
        vec![Effect::CancelTurn, Effect::FlushEgress]
    }

    fn apply_verdict(&mut self, forwardable: bool) -> Vec<Effect> {
        if forwardable {
            self.consecutive_clear += 1;
            self.consecutive_blocked = 0;
            if self.privacy_paused && self.consecutive_clear >= PRIVACY_RESUME_AFTER_CLEAR {
                self.privacy_paused = false;
                tracing::info!("privacy halt lifted");
                return vec![Effect::AudioResumed];
            }
        } else {
            self.consecutive_blocked += 1;
            self.consecutive_clear = 0;
            if !self.privacy_paused && self.consecutive_blocked >= PRIVACY_PAUSE_AFTER_BLOCKS {
                self.privacy_paused = true;
                tracing::warn!("privacy halt engaged: pausing audio forwarding");
                return vec![Effect::AudioPaused];
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationState::*;

    const SPEECH: u32 = 2000;
    const QUIET: u32 = 10;

    fn fsm() -> (ConversationFsm, watch::Receiver<ConversationState>) {
        ConversationFsm::new(
            CancellationToken::new(),
            900,
            Duration::from_millis(200),
        )
    }

    /// Drive the machine to `Speaking` via the normal path.
    fn speak(machine: &mut ConversationFsm, now: Instant) {
        let effects = machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        assert_eq!(effects, vec![Effect::OpenTurn]);
        machine.apply(FsmEvent::UpstreamAudio, now);
        assert_eq!(machine.state(), Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_audio_does_not_leave_idle() {
        let (mut machine, _rx) = fsm();
        machine.apply(FsmEvent::UserAudio { rms: QUIET }, Instant::now());
        assert_eq!(machine.state(), Idle);
        assert!(machine.current_turn_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn speech_opens_turn_and_listens() {
        let (mut machine, _rx) = fsm();
        let effects = machine.apply(FsmEvent::UserAudio { rms: SPEECH }, Instant::now());
        assert_eq!(machine.state(), Listening);
        assert_eq!(effects, vec![Effect::OpenTurn]);
        assert_eq!(machine.current_turn_id(), Some(1));
        assert!(machine.should_forward_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn full_happy_path() {
        let (mut machine, mut rx) = fsm();
        let now = Instant::now();
        machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        machine.apply(FsmEvent::UpstreamResponseStarted, now);
        assert_eq!(machine.state(), Analyzing);
        assert!(!machine.should_forward_audio());
        machine.apply(FsmEvent::UpstreamAudio, now);
        assert_eq!(machine.state(), Speaking);
        machine.apply(FsmEvent::UpstreamTurnComplete, now);
        assert_eq!(machine.state(), Idle);
        assert_eq!(machine.last_completion(), Some(CompletionReason::Finished));
        // Observer saw the final state.
        assert_eq!(*rx.borrow_and_update(), Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_before_text_passes_through_analyzing() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        machine.apply(FsmEvent::UpstreamAudio, now);
        assert_eq!(machine.state(), Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_requires_sustained_speech() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        speak(&mut machine, now);

        // 180 ms of speech: below the 200 ms window, no interruption.
        for _ in 0..9 {
            let effects = machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
            assert!(effects.is_empty());
        }
        assert_eq!(machine.state(), Speaking);

        // A quiet chunk resets the run.
        machine.apply(FsmEvent::UserAudio { rms: QUIET }, now);
        for _ in 0..9 {
            machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        }
        assert_eq!(machine.state(), Speaking);

        // The 10th consecutive chunk crosses 200 ms.
        let effects = machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        assert_eq!(effects, vec![Effect::CancelTurn, Effect::FlushEgress]);
        assert_eq!(machine.state(), Interrupted);
        assert_eq!(
            machine.last_completion(),
            Some(CompletionReason::Interrupted)
        );
        // The turn token is cancelled so in-flight work stops.
        assert!(machine.turn_token().unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_turn_reopens_on_confirmation() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        speak(&mut machine, now);
        for _ in 0..10 {
            machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        }
        assert_eq!(machine.state(), Interrupted);
        // Audio keeps flowing immediately after interruption.
        assert!(machine.should_forward_audio());

        let later = now + Duration::from_millis(300);
        let effects = machine.apply(FsmEvent::UpstreamTurnComplete, later);
        assert_eq!(machine.state(), Listening);
        assert_eq!(effects, vec![Effect::OpenTurn]);
        assert_eq!(machine.current_turn_id(), Some(2));
        // Outside the tie window the completion stays an interruption.
        assert_eq!(
            machine.last_completion(),
            None,
            "new turn has no completion yet"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn turn_complete_wins_within_tie_window() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        speak(&mut machine, now);
        for _ in 0..10 {
            machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        }
        assert_eq!(machine.state(), Interrupted);
        let old_turn = machine.current_turn_id();

        let just_after = now + Duration::from_millis(30);
        machine.apply(FsmEvent::UpstreamTurnComplete, just_after);
        assert_eq!(machine.state(), Listening);
        assert_ne!(machine.current_turn_id(), old_turn);
    }

    #[tokio::test(start_paused = true)]
    async fn client_interrupt_is_immediate() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        speak(&mut machine, now);
        let effects = machine.apply(FsmEvent::ClientInterrupt, now);
        assert_eq!(effects, vec![Effect::CancelTurn, Effect::FlushEgress]);
        assert_eq!(machine.state(), Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_interrupted_goes_straight_to_listening() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        speak(&mut machine, now);
        let effects = machine.apply(FsmEvent::UpstreamInterrupted, now);
        assert_eq!(machine.state(), Listening);
        assert!(effects.contains(&Effect::FlushEgress));
        assert!(effects.contains(&Effect::OpenTurn));
    }

    #[tokio::test(start_paused = true)]
    async fn three_blocks_pause_audio_two_clears_resume() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        assert!(machine.should_forward_audio());

        assert!(machine
            .apply(FsmEvent::PrivacyVerdict { forwardable: false }, now)
            .is_empty());
        assert!(machine
            .apply(FsmEvent::PrivacyVerdict { forwardable: false }, now)
            .is_empty());
        let effects = machine.apply(FsmEvent::PrivacyVerdict { forwardable: false }, now);
        assert_eq!(effects, vec![Effect::AudioPaused]);
        assert!(!machine.should_forward_audio());
        assert!(machine.privacy_paused());

        assert!(machine
            .apply(FsmEvent::PrivacyVerdict { forwardable: true }, now)
            .is_empty());
        let effects = machine.apply(FsmEvent::PrivacyVerdict { forwardable: true }, now);
        assert_eq!(effects, vec![Effect::AudioResumed]);
        assert!(machine.should_forward_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_run_broken_by_clear_does_not_pause() {
        let (mut machine, _rx) = fsm();
        let now = Instant::now();
        machine.apply(FsmEvent::PrivacyVerdict { forwardable: false }, now);
        machine.apply(FsmEvent::PrivacyVerdict { forwardable: false }, now);
        machine.apply(FsmEvent::PrivacyVerdict { forwardable: true }, now);
        let effects = machine.apply(FsmEvent::PrivacyVerdict { forwardable: false }, now);
        assert!(effects.is_empty());
        assert!(!machine.privacy_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_terminal_and_cancels_turn() {
        let (mut machine, mut rx) = fsm();
        let now = Instant::now();
        machine.apply(FsmEvent::UserAudio { rms: SPEECH }, now);
        let token = machine.turn_token().unwrap();

        let effects = machine.apply(FsmEvent::Fatal, now);
        assert_eq!(effects, vec![Effect::TearDown]);
        assert_eq!(machine.state(), Fatal);
        assert!(token.is_cancelled());
        assert_eq!(*rx.borrow_and_update(), Fatal);

        // Nothing moves a fatal machine.
        assert!(machine
            .apply(FsmEvent::UserAudio { rms: SPEECH }, now)
            .is_empty());
        assert_eq!(machine.state(), Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cancel_cascades_to_turn_token() {
        let session_token = CancellationToken::new();
        let (mut machine, _rx) = ConversationFsm::new(
            session_token.clone(),
            900,
            Duration::from_millis(200),
        );
        machine.apply(FsmEvent::UserAudio { rms: SPEECH }, Instant::now());
        let turn_token = machine.turn_token().unwrap();
        assert!(!turn_token.is_cancelled());
        session_token.cancel();
        assert!(turn_token.is_cancelled());
    }

    #[test]
    fn legal_edges_match_the_table() {
        assert!(legal_transition(Idle, Listening));
        assert!(legal_transition(Listening, Analyzing));
        assert!(legal_transition(Analyzing, Speaking));
        assert!(legal_transition(Speaking, Interrupted));
        assert!(legal_transition(Speaking, Idle));
        assert!(legal_transition(Interrupted, Listening));
        assert!(legal_transition(Speaking, Fatal));
        assert!(legal_transition(Idle, Fatal));

        assert!(!legal_transition(Idle, Speaking));
        assert!(!legal_transition(Listening, Speaking));
        assert!(!legal_transition(Interrupted, Idle));
        assert!(!legal_transition(Analyzing, Interrupted));
    }
}
