//! Application state and the single reducer that changes it.
//!
//! [`AppState`] is never mutated directly. The dispatcher describes every change as a
//! [`StateUpdate`] and applies it with [`AppState::apply`], then forwards the same update
//! to the UI, which applies it to its own mirror. Both copies therefore go through
//! identical transitions in identical order.

use super::channel::{Channel, OperationId};
use crate::chat::ChatSettings;
use crate::error::{Failure, Outcome};
use crate::knowledge::KnowledgeView;
use crate::pricing::{CostLedger, TurnCost};
use crate::provider::{TokenUsage, Turn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One immutable change to [`AppState`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    OperationStarted {
        channel: Channel,
        op: OperationId,
        label: String,
    },
    OperationFinished {
        channel: Channel,
        op: OperationId,
        outcome: Outcome,
    },
    Retrying {
        channel: Channel,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// The user turn was appended and an assistant response is pending.
    TurnStarted {
        user: Turn,
    },
    /// A retry restarted the response; partial text so far is void.
    TurnRestarted,
    ResponseCreated {
        id: String,
    },
    PartialText {
        delta: String,
    },
    UsageUpdated(TokenUsage),
    TurnSealed {
        turn: Turn,
        cost: TurnCost,
        attempts: u32,
    },
    TurnDiscarded,
    ConversationCleared,
    SettingsChanged(ChatSettings),
    KnowledgeChanged(KnowledgeView),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Idle,
    Running {
        op: OperationId,
        label: String,
    },
}

impl ChannelState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ChannelState::Idle)
    }
}

/// The assistant response currently streaming in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingTurn {
    pub text: String,
    pub usage: TokenUsage,
}

/// Latest retry diagnostic, shown until the operation finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryNotice {
    pub channel: Channel,
    pub attempt: u32,
    pub delay: Duration,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub settings: ChatSettings,
    pub conversation: Vec<Turn>,
    pub pending: Option<PendingTurn>,
    pub last_response_id: Option<String>,
    pub knowledge: KnowledgeView,
    pub chat_channel: ChannelState,
    pub knowledge_channel: ChannelState,
    pub last_error: Option<Failure>,
    pub last_retry: Option<RetryNotice>,
    /// Attempts used by the most recent sealed turn.
    pub last_attempts: Option<u32>,
    pub cost: CostLedger,
}

impl AppState {
    pub fn new(settings: ChatSettings) -> Self {
        Self {
            settings,
            conversation: Vec::new(),
            pending: None,
            last_response_id: None,
            knowledge: KnowledgeView::default(),
            chat_channel: ChannelState::Idle,
            knowledge_channel: ChannelState::Idle,
            last_error: None,
            last_retry: None,
            last_attempts: None,
            cost: CostLedger::default(),
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Chat => &self.chat_channel,
            Channel::Knowledge => &self.knowledge_channel,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelState {
        match channel {
            Channel::Chat => &mut self.chat_channel,
            Channel::Knowledge => &mut self.knowledge_channel,
        }
    }

    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::OperationStarted { channel, op, label } => {
                *self.channel_mut(channel) = ChannelState::Running { op, label };
                self.last_error = None;
                self.last_retry = None;
            }
            StateUpdate::OperationFinished {
                channel,
                op,
                outcome,
            } => {
                let slot = self.channel_mut(channel);
                if matches!(slot, ChannelState::Running { op: current, .. } if *current == op) {
                    *slot = ChannelState::Idle;
                }
                if channel == Channel::Chat {
                    self.pending = None;
                }
                if self.last_retry.as_ref().is_some_and(|r| r.channel == channel) {
                    self.last_retry = None;
                }
                if let Outcome::Failed(failure) = outcome {
                    self.last_error = Some(failure);
                }
            }
            StateUpdate::Retrying {
                channel,
                attempt,
                delay,
                reason,
            } => {
                self.last_retry = Some(RetryNotice {
                    channel,
                    attempt,
                    delay,
                    reason,
                });
            }
            StateUpdate::TurnStarted { user } => {
                self.conversation.push(user);
                self.pending = Some(PendingTurn::default());
                self.last_attempts = None;
            }
            StateUpdate::TurnRestarted => {
                self.pending = Some(PendingTurn::default());
            }
            StateUpdate::ResponseCreated { id } => {
                self.last_response_id = Some(id);
            }
            StateUpdate::PartialText { delta } => {
                if let Some(pending) = &mut self.pending {
                    pending.text.push_str(&delta);
                }
            }
            StateUpdate::UsageUpdated(usage) => {
                if let Some(pending) = &mut self.pending {
                    pending.usage = usage;
                }
            }
            StateUpdate::TurnSealed {
                turn,
                cost,
                attempts,
            } => {
                self.pending = None;
                if let Some(id) = &turn.response_id {
                    self.last_response_id = Some(id.clone());
                }
                self.conversation.push(turn);
                self.cost.record(&cost);
                self.last_attempts = Some(attempts);
            }
            StateUpdate::TurnDiscarded => {
                self.pending = None;
            }
            StateUpdate::ConversationCleared => {
                self.conversation.clear();
                self.pending = None;
                self.last_response_id = None;
                self.last_attempts = None;
                self.cost = CostLedger::default();
            }
            StateUpdate::SettingsChanged(settings) => {
                self.settings = settings;
            }
            StateUpdate::KnowledgeChanged(view) => {
                self.knowledge = view;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Cost;

    fn state() -> AppState {
        AppState::new(ChatSettings {
            model: "gpt-5.2".into(),
            system_prompt: String::new(),
            prompt_mode: None,
            reasoning_effort: None,
            file_search: None,
        })
    }

    #[test]
    fn test_finish_only_releases_matching_op() {
        let mut state = state();
        state.apply(StateUpdate::OperationStarted {
            channel: Channel::Chat,
            op: OperationId(2),
            label: "send".into(),
        });
        state.apply(StateUpdate::OperationFinished {
            channel: Channel::Chat,
            op: OperationId(1),
            outcome: Outcome::Completed,
        });
        assert!(!state.chat_channel.is_idle());

        state.apply(StateUpdate::OperationFinished {
            channel: Channel::Chat,
            op: OperationId(2),
            outcome: Outcome::Failed(Failure::internal("boom")),
        });
        assert!(state.chat_channel.is_idle());
        assert_eq!(state.last_error, Some(Failure::internal("boom")));
    }

    #[test]
    fn test_restart_discards_partial_text() {
        let mut state = state();
        state.apply(StateUpdate::TurnStarted {
            user: Turn::user("q"),
        });
        state.apply(StateUpdate::PartialText {
            delta: "half an ans".into(),
        });
        state.apply(StateUpdate::TurnRestarted);
        state.apply(StateUpdate::PartialText {
            delta: "fresh".into(),
        });

        assert_eq!(state.pending.unwrap().text, "fresh");
    }

    #[test]
    fn test_seal_records_cost_and_response_id() {
        let mut state = state();
        state.apply(StateUpdate::TurnStarted {
            user: Turn::user("q"),
        });
        let mut turn = Turn::assistant("a");
        turn.response_id = Some("resp_1".into());
        state.apply(StateUpdate::TurnSealed {
            turn,
            cost: TurnCost::Priced { cost: Cost(500) },
            attempts: 2,
        });

        assert_eq!(state.conversation.len(), 2);
        assert!(state.pending.is_none());
        assert_eq!(state.last_response_id.as_deref(), Some("resp_1"));
        assert_eq!(state.cost.session_total, Cost(500));
        assert_eq!(state.last_attempts, Some(2));
    }

    #[test]
    fn test_clear_resets_session() {
        let mut state = state();
        state.apply(StateUpdate::TurnStarted {
            user: Turn::user("q"),
        });
        state.apply(StateUpdate::TurnSealed {
            turn: Turn::assistant("a"),
            cost: TurnCost::Unavailable {
                model: "x".into(),
            },
            attempts: 1,
        });
        state.apply(StateUpdate::ConversationCleared);

        assert!(state.conversation.is_empty());
        assert_eq!(state.cost, CostLedger::default());
        assert_eq!(state.last_response_id, None);
    }
}
