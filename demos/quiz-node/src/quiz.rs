//! Quiz progress: one entity per user, counting right and wrong answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shardhold::prelude::*;

/// Record the answer to one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub correct: bool,
}

impl Command for Answer {
    const TYPE: &'static str = "answer";
    type Reply = Progress;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProgress;

impl Command for GetProgress {
    const TYPE: &'static str = "progress";
    type Reply = Progress;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reset;

impl Command for Reset {
    const TYPE: &'static str = "reset";
    type Reply = Progress;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuizEvent {
    Answered { question_id: String, correct: bool },
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizState {
    /// Latest outcome per question.
    pub answers: BTreeMap<String, bool>,
    pub attempts: u64,
}

/// Reply summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub correct: usize,
    pub incorrect: usize,
    pub attempts: u64,
}

impl From<&QuizState> for Progress {
    fn from(state: &QuizState) -> Self {
        let correct = state.answers.values().filter(|c| **c).count();
        Self {
            correct,
            incorrect: state.answers.len() - correct,
            attempts: state.attempts,
        }
    }
}

#[derive(Clone)]
pub struct QuizProgress;

impl Behavior for QuizProgress {
    type State = QuizState;
    type Event = QuizEvent;

    fn name(&self) -> &str {
        "QuizProgress"
    }

    fn apply(&self, state: &mut QuizState, event: &QuizEvent) {
        match event {
            QuizEvent::Answered {
                question_id,
                correct,
            } => {
                state.answers.insert(question_id.clone(), *correct);
                state.attempts += 1;
            }
            QuizEvent::Reset => *state = QuizState::default(),
        }
    }

    fn handlers(&self) -> HandlerTable<QuizState, QuizEvent> {
        HandlerTable::<QuizState, QuizEvent>::new()
            .on::<Answer, _>(|_, answer| {
                if answer.question_id.is_empty() {
                    return Err(ClusterError::Rejected {
                        reason: "question_id must not be empty".into(),
                    });
                }
                Ok(Effect::persist(vec![QuizEvent::Answered {
                    question_id: answer.question_id,
                    correct: answer.correct,
                }])
                .then_reply(|state: &QuizState| Progress::from(state)))
            })
            .on::<GetProgress, _>(|state: &QuizState, _| Ok(Effect::reply(Progress::from(state))))
            .on::<Reset, _>(|state: &QuizState, _| {
                if state.attempts == 0 {
                    return Ok(Effect::reply(Progress::from(state)));
                }
                Ok(Effect::persist(vec![QuizEvent::Reset])
                    .then_reply(|state: &QuizState| Progress::from(state)))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardhold::testing::TestCluster;

    #[tokio::test]
    async fn answers_are_counted_per_question() {
        let cluster = TestCluster::new(QuizProgress, 2).await.unwrap();
        let region = cluster.region(0);
        let answer = |question_id: &str, correct| Answer {
            question_id: question_id.to_string(),
            correct,
        };

        region.ask("alice", &answer("q1", false)).await.unwrap();
        region.ask("alice", &answer("q2", true)).await.unwrap();
        let progress = region.ask("alice", &answer("q1", true)).await.unwrap();
        assert_eq!(
            progress,
            Progress {
                correct: 2,
                incorrect: 0,
                attempts: 3
            }
        );

        let other = cluster.region(1).ask("bob", &GetProgress).await.unwrap();
        assert_eq!(other.attempts, 0);

        let reset = cluster.region(1).ask("alice", &Reset).await.unwrap();
        assert_eq!(reset.attempts, 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let cluster = TestCluster::new(QuizProgress, 1).await.unwrap();
        let err = cluster
            .region(0)
            .ask(
                "alice",
                &Answer {
                    question_id: String::new(),
                    correct: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { .. }));
        cluster.shutdown().await;
    }
}
