use serde::{Deserialize, Serialize};

use crate::models::{split_answer_tokens, AnswerKey, Question, QuestionType, Quiz};

/// How a single answer is scored inside a particular quiz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marking {
    /// Points awarded for a correct answer (the quiz's override, if any)
    pub points: f64,
    /// Points deducted for a wrong answer when negative marking is on
    pub penalty: Option<f64>,
}

impl Marking {
    pub fn new(points: f64, penalty: Option<f64>) -> Self {
        Self { points, penalty }
    }

    pub fn for_quiz(quiz: &Quiz, points: f64) -> Self {
        Self::new(points, quiz.penalty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub is_correct: bool,
    pub points_earned: f64,
}

/// Grade one submitted answer.
///
/// Wrong answers under negative marking earn `-penalty`; there is no floor,
/// so an attempt's total may drop below zero.
pub fn grade(question: &Question, submitted: &str, marking: Marking) -> Grade {
    let is_correct = is_correct(question.question_type, &question.correct_answer, submitted);

    let points_earned = match (is_correct, marking.penalty) {
        (true, _) => marking.points,
        (false, Some(penalty)) => -penalty,
        (false, None) => 0.0,
    };

    Grade {
        is_correct,
        points_earned,
    }
}

/// Correctness only, independent of any scoring policy
pub fn is_correct(question_type: QuestionType, key: &AnswerKey, submitted: &str) -> bool {
    match question_type {
        QuestionType::MultiSelect => {
            let expected = key.token_set();
            !expected.is_empty() && expected == split_answer_tokens(submitted)
        }
        QuestionType::MultipleChoice | QuestionType::TrueFalse | QuestionType::FillInBlank => {
            let expected = match key {
                AnswerKey::Single(value) => value.as_str(),
                AnswerKey::Multiple(set) if set.len() == 1 => {
                    set.iter().next().map(String::as_str).unwrap_or_default()
                }
                AnswerKey::Multiple(_) => return false,
            };
            normalize(expected) == normalize(submitted)
        }
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
