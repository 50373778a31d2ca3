use rand::{Rng, seq::SliceRandom};

use crate::{
    engine::error::EngineError,
    models::{question::CandidateAnswer, template::AnswerDistribution, test::PickedAnswer},
};

/// Remaining slots to fill while walking the shuffled answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quotas {
    correct: usize,
    incorrect: usize,
    free: usize,
}

impl Quotas {
    fn for_policy(required: usize, policy: AnswerDistribution) -> Self {
        match policy {
            AnswerDistribution::ExactlyOneCorrect => Self {
                correct: 1,
                incorrect: required.saturating_sub(1),
                free: 0,
            },
            AnswerDistribution::MinimumOneCorrect => Self {
                correct: 1,
                incorrect: 0,
                free: required.saturating_sub(1),
            },
            AnswerDistribution::MinimumOneCorrectOneIncorrect => Self {
                correct: 1,
                incorrect: 1,
                free: required.saturating_sub(2),
            },
        }
    }

    fn exhausted(&self) -> bool {
        self.correct == 0 && self.incorrect == 0 && self.free == 0
    }

    /// Routes an answer into the first open quota it can fill.
    fn take(&mut self, correct: bool) -> bool {
        let own = if correct {
            &mut self.correct
        } else {
            &mut self.incorrect
        };
        if *own > 0 {
            *own -= 1;
            return true;
        }
        if self.free > 0 {
            self.free -= 1;
            return true;
        }
        false
    }
}

/// Picks a randomized answer subset that satisfies `policy`.
///
/// Order indices are 1..=n in the final shuffled order.
pub fn pick_answers<R: Rng + ?Sized>(
    required: usize,
    candidates: &[CandidateAnswer],
    policy: AnswerDistribution,
    rng: &mut R,
) -> Result<Vec<PickedAnswer>, EngineError> {
    let mut quotas = Quotas::for_policy(required, policy);

    let mut pool: Vec<&CandidateAnswer> = candidates.iter().collect();
    pool.shuffle(rng);

    let mut picked: Vec<&CandidateAnswer> = Vec::with_capacity(required);
    for answer in pool {
        if quotas.exhausted() {
            break;
        }
        if quotas.take(answer.correct) {
            picked.push(answer);
        }
    }

    if !quotas.exhausted() {
        return Err(EngineError::NotEnoughAnswers { required });
    }

    picked.shuffle(rng);

    Ok(picked
        .into_iter()
        .enumerate()
        .map(|(i, a)| PickedAnswer {
            answer_id: a.id,
            correct: a.correct,
            order: i as i32 + 1,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn answers(correct: usize, incorrect: usize) -> Vec<CandidateAnswer> {
        (0..correct)
            .map(|i| CandidateAnswer {
                id: i as i64 + 1,
                correct: true,
            })
            .chain((0..incorrect).map(|i| CandidateAnswer {
                id: 100 + i as i64,
                correct: false,
            }))
            .collect()
    }

    fn count_correct(picked: &[PickedAnswer]) -> usize {
        picked.iter().filter(|a| a.correct).count()
    }

    #[test]
    fn test_quotas_floor_at_zero() {
        let q = Quotas::for_policy(1, AnswerDistribution::MinimumOneCorrectOneIncorrect);
        assert_eq!(
            q,
            Quotas {
                correct: 1,
                incorrect: 1,
                free: 0
            }
        );
        let q = Quotas::for_policy(0, AnswerDistribution::ExactlyOneCorrect);
        assert_eq!(q.incorrect, 0);
    }

    #[test]
    fn test_exactly_one_correct() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = answers(3, 5);
        for _ in 0..50 {
            let picked =
                pick_answers(4, &pool, AnswerDistribution::ExactlyOneCorrect, &mut rng).unwrap();
            assert_eq!(picked.len(), 4);
            assert_eq!(count_correct(&picked), 1);
        }
    }

    #[test]
    fn test_minimum_one_correct_one_incorrect() {
        let mut rng = StdRng::seed_from_u64(11);
        let pool = answers(4, 4);
        for _ in 0..50 {
            let picked = pick_answers(
                3,
                &pool,
                AnswerDistribution::MinimumOneCorrectOneIncorrect,
                &mut rng,
            )
            .unwrap();
            assert_eq!(picked.len(), 3);
            assert!(count_correct(&picked) >= 1);
            assert!(picked.iter().any(|a| !a.correct));
        }
    }

    #[test]
    fn test_minimum_one_correct_allows_all_correct() {
        let mut rng = StdRng::seed_from_u64(3);
        let picked =
            pick_answers(3, &answers(3, 0), AnswerDistribution::MinimumOneCorrect, &mut rng)
                .unwrap();
        assert_eq!(count_correct(&picked), 3);
    }

    #[test]
    fn test_order_indices_are_sequential() {
        let mut rng = StdRng::seed_from_u64(5);
        let picked =
            pick_answers(4, &answers(2, 4), AnswerDistribution::MinimumOneCorrect, &mut rng)
                .unwrap();
        let orders: Vec<i32> = picked.iter().map(|a| a.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fails_without_correct_answer() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = pick_answers(2, &answers(0, 5), AnswerDistribution::MinimumOneCorrect, &mut rng)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotEnoughAnswers { required: 2 }));
    }

    #[test]
    fn test_fails_when_pool_too_small() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = pick_answers(5, &answers(1, 2), AnswerDistribution::ExactlyOneCorrect, &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn test_picked_answers_are_distinct() {
        let mut rng = StdRng::seed_from_u64(9);
        let picked =
            pick_answers(5, &answers(5, 5), AnswerDistribution::MinimumOneCorrect, &mut rng)
                .unwrap();
        let mut ids: Vec<i64> = picked.iter().map(|a| a.answer_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
