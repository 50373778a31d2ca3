//! Instance lifecycle: Ready -> Active -> Finished | Expired.
//!
//! These functions mutate in-memory rows and return the audit events the
//! transition produced. Callers persist both inside one transaction.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::{
    engine::error::EngineError,
    models::{
        instance::{
            EventType, InstanceEvent, InstanceForm, InstanceQuestion, InstanceState,
            QuestionResponse, TestInstance,
        },
        template::QuestionFormat,
    },
    utils::ip_range::{is_ip_allowed, is_unrestricted},
};

/// Who is writing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Participant(i64),
    Reviewer(i64),
}

impl Actor {
    pub fn user_id(self) -> i64 {
        match self {
            Actor::Participant(id) | Actor::Reviewer(id) => id,
        }
    }
}

/// Inputs the Start transition reads from outside the instance row.
#[derive(Debug, Clone, Copy)]
pub struct StartContext {
    pub now: DateTime<Utc>,
    pub time_limit_minutes: i32,
    pub term_active_to: DateTime<Utc>,

    /// Whether the participant joined the instance's term.
    pub joined_term: bool,

    /// Result of the guarded "any other Active instance?" query.
    pub another_active: bool,
}

/// Attempt budgets of a course item and its term, with what the participant
/// already used.
#[derive(Debug, Clone, Copy)]
pub struct AttemptUsage {
    pub item_max_attempts: i32,

    /// Budget of the parent group item, which caps the item's own.
    pub group_max_attempts: Option<i32>,
    pub item_attempts: i64,
    pub term_tries: i32,
    pub term_attempts: i64,
}

/// Attempts the participant may still create: the smaller of what the item
/// and the term allow.
pub fn attempts_left(usage: AttemptUsage) -> u32 {
    let item_max = match usage.group_max_attempts {
        Some(group_max) => usage.item_max_attempts.min(group_max),
        None => usage.item_max_attempts,
    };
    let item_left = (i64::from(item_max) - usage.item_attempts).max(0);
    let term_left = (i64::from(usage.term_tries) - usage.term_attempts).max(0);
    u32::try_from(item_left.min(term_left)).unwrap_or(u32::MAX)
}

/// Fails when a new instance would exceed the participant's attempt budget.
pub fn ensure_attempt_available(participant_id: i64, usage: AttemptUsage) -> Result<u32, EngineError> {
    match attempts_left(usage) {
        0 => Err(EngineError::NoAttemptsLeft { participant_id }),
        left => Ok(left),
    }
}

/// Stored state with lazy expiry applied: an Active instance past its
/// deadline reads as Expired.
pub fn effective_state(instance: &TestInstance, now: DateTime<Utc>) -> InstanceState {
    match (instance.state, instance.ends_at) {
        (InstanceState::Active, Some(ends_at)) if now >= ends_at => InstanceState::Expired,
        (state, _) => state,
    }
}

/// Deadline of a started instance: the time limit or the end of the term, whichever is first.
pub fn compute_ends_at(
    now: DateTime<Utc>,
    time_limit_minutes: i32,
    term_active_to: DateTime<Utc>,
) -> DateTime<Utc> {
    let by_limit = now + Duration::minutes(i64::from(time_limit_minutes.max(0)));
    by_limit.min(term_active_to)
}

/// Rejects addresses outside the course item's allow-list. An empty list allows everyone.
pub fn check_network(ip_ranges: &str, address: IpAddr) -> Result<(), EngineError> {
    if is_unrestricted(ip_ranges) || is_ip_allowed(ip_ranges, address) {
        return Ok(());
    }
    Err(EngineError::NetworkDenied {
        address: address.to_string(),
    })
}

/// Audit event for a rejected address.
pub fn invalid_ip_event(
    instance_id: i64,
    user_id: i64,
    address: IpAddr,
    now: DateTime<Utc>,
) -> InstanceEvent {
    InstanceEvent {
        instance_id,
        user_id,
        occurred_at: now,
        event_type: EventType::InvalidIp,
        event_data: json!({ "address": address.to_string() }),
    }
}

/// Ready -> Active.
pub fn start(
    instance: &mut TestInstance,
    participant_id: i64,
    ctx: StartContext,
) -> Result<InstanceEvent, EngineError> {
    if instance.participant_id != participant_id {
        return Err(EngineError::NotOwner);
    }
    if !ctx.joined_term {
        return Err(EngineError::NotJoined {
            term_id: instance.term_id,
        });
    }
    if instance.form != InstanceForm::Online {
        return Err(EngineError::NotOnline);
    }
    if instance.state != InstanceState::Ready {
        return Err(EngineError::InvalidState {
            expected: "READY",
            actual: instance.state,
        });
    }
    if ctx.another_active {
        return Err(EngineError::AnotherInstanceActive);
    }

    let ends_at = compute_ends_at(ctx.now, ctx.time_limit_minutes, ctx.term_active_to);
    instance.state = InstanceState::Active;
    instance.started_at = Some(ctx.now);
    instance.ends_at = Some(ends_at);

    Ok(InstanceEvent {
        instance_id: instance.id,
        user_id: participant_id,
        occurred_at: ctx.now,
        event_type: EventType::TestStart,
        event_data: json!({ "endsAt": ends_at }),
    })
}

/// Guard shared by Save and Finish: own instance, Active and not past its deadline.
pub fn ensure_writable(
    instance: &TestInstance,
    participant_id: i64,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    if instance.participant_id != participant_id {
        return Err(EngineError::NotOwner);
    }
    match effective_state(instance, now) {
        InstanceState::Active => Ok(()),
        InstanceState::Expired if instance.state == InstanceState::Active => {
            Err(EngineError::TimeExpired)
        }
        actual => Err(EngineError::InvalidState {
            expected: "ACTIVE",
            actual,
        }),
    }
}

/// Applies one question's payload and returns the resulting audit events.
/// Writes that change nothing produce no events.
pub fn apply_response(
    instance_id: i64,
    question: &mut InstanceQuestion,
    response: &QuestionResponse,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceEvent>, EngineError> {
    let mut events = Vec::new();
    let event = |data: serde_json::Value| InstanceEvent {
        instance_id,
        user_id: actor.user_id(),
        occurred_at: now,
        event_type: EventType::QuestionUpdate,
        event_data: data,
    };

    match question.question_format {
        QuestionFormat::Open => {
            if let Some(text) = &response.text_answer {
                if question.text_answer.as_deref() != Some(text.as_str()) {
                    question.text_answer = Some(text.clone());
                    events.push(event(json!({
                        "questionOrder": question.order,
                        "answerData": text,
                    })));
                }
            }
            apply_review(question, response, actor)?;
        }
        QuestionFormat::Test => {
            for selection in &response.answers {
                let answer = question
                    .answers
                    .iter_mut()
                    .find(|a| a.id == selection.id)
                    .ok_or(EngineError::UnknownAnswer(selection.id))?;

                if answer.selected != selection.selected {
                    answer.selected = selection.selected;
                    events.push(event(json!({
                        "questionOrder": question.order,
                        "answerOrder": answer.order,
                        "answerData": selection.selected,
                    })));
                }
            }
        }
    }

    Ok(events)
}

/// Stores the lazily observed expiry of an overdue Active instance.
/// Returns false when there is nothing to converge.
pub fn expire(instance: &mut TestInstance, now: DateTime<Utc>) -> bool {
    if instance.state != InstanceState::Active
        || effective_state(instance, now) != InstanceState::Expired
    {
        return false;
    }
    instance.state = InstanceState::Expired;
    instance.ended_at = instance.ends_at;
    true
}

/// Participant save of a single question while the instance is Active.
pub fn save(
    instance: &TestInstance,
    question: &mut InstanceQuestion,
    response: &QuestionResponse,
    participant_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceEvent>, EngineError> {
    ensure_writable(instance, participant_id, now)?;
    if question.id != response.id {
        return Err(EngineError::UnknownQuestion(response.id));
    }
    apply_response(
        instance.id,
        question,
        response,
        Actor::Participant(participant_id),
        now,
    )
}

fn apply_review(
    question: &mut InstanceQuestion,
    response: &QuestionResponse,
    actor: Actor,
) -> Result<(), EngineError> {
    let Some(reviewed) = response.text_answer_reviewed else {
        return Ok(());
    };
    let Actor::Reviewer(reviewer_id) = actor else {
        return Err(EngineError::ReviewNotAllowed);
    };

    if !reviewed {
        question.reviewed_by_id = None;
        return Ok(());
    }

    let percentage = response.text_answer_percentage.unwrap_or(question.percentage);
    if !(0.0..=100.0).contains(&percentage) {
        return Err(EngineError::InvalidPercentage(percentage));
    }
    question.percentage = percentage;
    question.reviewed_by_id = Some(reviewer_id);
    Ok(())
}

fn apply_all(
    instance_id: i64,
    questions: &mut [InstanceQuestion],
    responses: &[QuestionResponse],
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceEvent>, EngineError> {
    let mut events = Vec::new();
    for response in responses {
        let question = questions
            .iter_mut()
            .find(|q| q.id == response.id)
            .ok_or(EngineError::UnknownQuestion(response.id))?;
        events.extend(apply_response(instance_id, question, response, actor, now)?);
    }
    Ok(events)
}

/// Participant-initiated Active -> Finished.
pub fn finish(
    instance: &mut TestInstance,
    questions: &mut [InstanceQuestion],
    responses: &[QuestionResponse],
    participant_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceEvent>, EngineError> {
    ensure_writable(instance, participant_id, now)?;
    let events = apply_all(
        instance.id,
        questions,
        responses,
        Actor::Participant(participant_id),
        now,
    )?;

    instance.state = InstanceState::Finished;
    instance.ended_at = Some(now);
    Ok(events)
}

/// Reviewer override. Ready and Active instances are force-finished regardless
/// of their timer; Finished and Expired ones keep their state and are only regraded.
pub fn tutor_finish(
    instance: &mut TestInstance,
    questions: &mut [InstanceQuestion],
    responses: &[QuestionResponse],
    bonus_points: f64,
    bonus_points_reason: &str,
    reviewer_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<InstanceEvent>, EngineError> {
    let mut events = Vec::new();

    if instance.bonus_points != bonus_points || instance.bonus_points_reason != bonus_points_reason
    {
        events.push(InstanceEvent {
            instance_id: instance.id,
            user_id: reviewer_id,
            occurred_at: now,
            event_type: EventType::BonusPoints,
            event_data: json!({
                "points": bonus_points,
                "reason": bonus_points_reason,
                "previousPoints": instance.bonus_points,
                "previousReason": instance.bonus_points_reason,
            }),
        });
    }
    instance.bonus_points = bonus_points;
    instance.bonus_points_reason = bonus_points_reason.to_string();

    match instance.state {
        InstanceState::Ready => {
            instance.started_at = Some(now);
            instance.ends_at = Some(now);
            instance.ended_at = Some(now);
            instance.state = InstanceState::Finished;
        }
        InstanceState::Active => {
            instance.ended_at = Some(now);
            instance.state = InstanceState::Finished;
        }
        InstanceState::Finished | InstanceState::Expired => {}
    }

    events.extend(apply_all(
        instance.id,
        questions,
        responses,
        Actor::Reviewer(reviewer_id),
        now,
    )?);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::{AnswerSelection, InstanceAnswer};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 10, minute, 0).unwrap()
    }

    fn instance(state: InstanceState) -> TestInstance {
        TestInstance {
            id: 1,
            test_id: 1,
            participant_id: 7,
            term_id: 1,
            course_item_id: 1,
            state,
            form: InstanceForm::Online,
            started_at: None,
            ends_at: None,
            ended_at: None,
            bonus_points: 0.0,
            bonus_points_reason: String::new(),
            created_at: at(0),
        }
    }

    fn ctx(another_active: bool) -> StartContext {
        StartContext {
            now: at(0),
            time_limit_minutes: 30,
            term_active_to: at(50),
            joined_term: true,
            another_active,
        }
    }

    fn open_question(id: i64) -> InstanceQuestion {
        InstanceQuestion {
            id,
            block_id: 1,
            question_format: QuestionFormat::Open,
            order: 1,
            text_answer: None,
            reviewed_by_id: None,
            percentage: 0.0,
            answers: vec![],
        }
    }

    fn choice_question(id: i64) -> InstanceQuestion {
        InstanceQuestion {
            id,
            block_id: 1,
            question_format: QuestionFormat::Test,
            order: 2,
            text_answer: None,
            reviewed_by_id: None,
            percentage: 0.0,
            answers: vec![
                InstanceAnswer {
                    id: 100,
                    instance_question_id: id,
                    correct: true,
                    order: 1,
                    selected: false,
                },
                InstanceAnswer {
                    id: 101,
                    instance_question_id: id,
                    correct: false,
                    order: 2,
                    selected: false,
                },
            ],
        }
    }

    fn response(id: i64) -> QuestionResponse {
        QuestionResponse {
            id,
            text_answer: None,
            text_answer_percentage: None,
            text_answer_reviewed: None,
            answers: vec![],
        }
    }

    #[test]
    fn test_ends_at_is_capped_by_term() {
        assert_eq!(compute_ends_at(at(0), 30, at(50)), at(30));
        assert_eq!(compute_ends_at(at(40), 30, at(50)), at(50));
    }

    #[test]
    fn test_start_sets_timer() {
        let mut ti = instance(InstanceState::Ready);
        let event = start(&mut ti, 7, ctx(false)).unwrap();
        assert_eq!(ti.state, InstanceState::Active);
        assert_eq!(ti.started_at, Some(at(0)));
        assert_eq!(ti.ends_at, Some(at(30)));
        assert_eq!(event.event_type, EventType::TestStart);
    }

    #[test]
    fn test_start_rejects_second_active_instance() {
        let mut ti = instance(InstanceState::Ready);
        let err = start(&mut ti, 7, ctx(true)).unwrap_err();
        assert!(matches!(err, EngineError::AnotherInstanceActive));
        assert_eq!(ti.state, InstanceState::Ready);
    }

    #[test]
    fn test_start_requires_term_membership() {
        let mut ti = instance(InstanceState::Ready);
        let outsider = StartContext {
            joined_term: false,
            ..ctx(false)
        };
        assert!(matches!(
            start(&mut ti, 7, outsider),
            Err(EngineError::NotJoined { term_id: 1 })
        ));
        assert_eq!(ti.state, InstanceState::Ready);
    }

    fn usage(item_attempts: i64, term_attempts: i64) -> AttemptUsage {
        AttemptUsage {
            item_max_attempts: 3,
            group_max_attempts: None,
            item_attempts,
            term_tries: 2,
            term_attempts,
        }
    }

    #[test]
    fn test_attempts_left_takes_tighter_budget() {
        assert_eq!(attempts_left(usage(0, 0)), 2);
        assert_eq!(attempts_left(usage(2, 0)), 1);
        assert_eq!(attempts_left(usage(1, 1)), 1);
        assert_eq!(attempts_left(usage(5, 0)), 0);

        let capped = AttemptUsage {
            group_max_attempts: Some(1),
            ..usage(0, 0)
        };
        assert_eq!(attempts_left(capped), 1);
    }

    #[test]
    fn test_no_attempts_left_is_rejected() {
        assert_eq!(ensure_attempt_available(7, usage(0, 1)).unwrap(), 1);
        assert!(matches!(
            ensure_attempt_available(7, usage(1, 2)),
            Err(EngineError::NoAttemptsLeft { participant_id: 7 })
        ));
    }

    #[test]
    fn test_start_rejects_offline_and_non_ready() {
        let mut offline = instance(InstanceState::Ready);
        offline.form = InstanceForm::Offline;
        assert!(matches!(
            start(&mut offline, 7, ctx(false)),
            Err(EngineError::NotOnline)
        ));

        let mut active = instance(InstanceState::Active);
        assert!(matches!(
            start(&mut active, 7, ctx(false)),
            Err(EngineError::InvalidState { .. })
        ));

        let mut foreign = instance(InstanceState::Ready);
        assert!(matches!(
            start(&mut foreign, 8, ctx(false)),
            Err(EngineError::NotOwner)
        ));
    }

    #[test]
    fn test_lazy_expiry() {
        let mut ti = instance(InstanceState::Ready);
        start(&mut ti, 7, ctx(false)).unwrap();
        assert_eq!(effective_state(&ti, at(29)), InstanceState::Active);
        assert_eq!(effective_state(&ti, at(30)), InstanceState::Expired);
        assert!(ensure_writable(&ti, 7, at(29)).is_ok());
        assert!(matches!(
            ensure_writable(&ti, 7, at(31)),
            Err(EngineError::TimeExpired)
        ));
    }

    #[test]
    fn test_expire_converges_stored_state() {
        let mut ti = instance(InstanceState::Ready);
        assert!(!expire(&mut ti, at(59)));

        start(&mut ti, 7, ctx(false)).unwrap();
        assert!(!expire(&mut ti, at(10)));
        assert!(expire(&mut ti, at(31)));
        assert_eq!(ti.state, InstanceState::Expired);
        assert_eq!(ti.ended_at, Some(at(30)));
    }

    #[test]
    fn test_network_check() {
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(check_network("", addr).is_ok());
        assert!(check_network("10.0.0.1-10.0.0.9", addr).is_ok());
        assert!(matches!(
            check_network("192.168.0.1", addr),
            Err(EngineError::NetworkDenied { .. })
        ));
    }

    #[test]
    fn test_selection_changes_emit_events() {
        let mut q = choice_question(5);
        let mut r = response(5);
        r.answers = vec![
            AnswerSelection { id: 100, selected: true },
            AnswerSelection { id: 101, selected: false },
        ];
        let events = apply_response(1, &mut q, &r, Actor::Participant(7), at(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(q.answers[0].selected);

        let again = apply_response(1, &mut q, &r, Actor::Participant(7), at(2)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_save_requires_active_instance() {
        let mut q = open_question(3);
        let mut r = response(3);
        r.text_answer = Some("draft".to_string());

        let ready = instance(InstanceState::Ready);
        assert!(matches!(
            save(&ready, &mut q, &r, 7, at(1)),
            Err(EngineError::InvalidState { .. })
        ));

        let mut active = instance(InstanceState::Ready);
        start(&mut active, 7, ctx(false)).unwrap();
        let events = save(&active, &mut q, &r, 7, at(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::QuestionUpdate);

        let other = response(4);
        assert!(matches!(
            save(&active, &mut q, &other, 7, at(1)),
            Err(EngineError::UnknownQuestion(4))
        ));
    }

    #[test]
    fn test_unknown_answer_rejected() {
        let mut q = choice_question(5);
        let mut r = response(5);
        r.answers = vec![AnswerSelection { id: 999, selected: true }];
        assert!(matches!(
            apply_response(1, &mut q, &r, Actor::Participant(7), at(1)),
            Err(EngineError::UnknownAnswer(999))
        ));
    }

    #[test]
    fn test_participant_cannot_review() {
        let mut q = open_question(3);
        let mut r = response(3);
        r.text_answer_reviewed = Some(true);
        r.text_answer_percentage = Some(100.0);
        assert!(matches!(
            apply_response(1, &mut q, &r, Actor::Participant(7), at(1)),
            Err(EngineError::ReviewNotAllowed)
        ));
    }

    #[test]
    fn test_reviewer_grades_open_question() {
        let mut q = open_question(3);
        let mut r = response(3);
        r.text_answer_reviewed = Some(true);
        r.text_answer_percentage = Some(75.0);
        apply_response(1, &mut q, &r, Actor::Reviewer(2), at(1)).unwrap();
        assert_eq!(q.reviewed_by_id, Some(2));
        assert_eq!(q.percentage, 75.0);

        r.text_answer_percentage = Some(120.0);
        assert!(matches!(
            apply_response(1, &mut q, &r, Actor::Reviewer(2), at(1)),
            Err(EngineError::InvalidPercentage(_))
        ));
    }

    #[test]
    fn test_finish_applies_all_and_closes() {
        let mut ti = instance(InstanceState::Ready);
        start(&mut ti, 7, ctx(false)).unwrap();
        let mut questions = vec![open_question(3), choice_question(5)];
        let mut open = response(3);
        open.text_answer = Some("42".to_string());
        let mut choice = response(5);
        choice.answers = vec![AnswerSelection { id: 100, selected: true }];

        let events = finish(&mut ti, &mut questions, &[open, choice], 7, at(10)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(ti.state, InstanceState::Finished);
        assert_eq!(ti.ended_at, Some(at(10)));
        assert_eq!(questions[0].text_answer.as_deref(), Some("42"));
    }

    #[test]
    fn test_finish_after_deadline_rejected() {
        let mut ti = instance(InstanceState::Ready);
        start(&mut ti, 7, ctx(false)).unwrap();
        let mut questions = vec![open_question(3)];
        assert!(matches!(
            finish(&mut ti, &mut questions, &[], 7, at(45)),
            Err(EngineError::TimeExpired)
        ));
        assert_eq!(ti.state, InstanceState::Active);
    }

    #[test]
    fn test_tutor_finish_from_ready_records_bonus() {
        let mut ti = instance(InstanceState::Ready);
        let mut questions = vec![open_question(3)];
        let events =
            tutor_finish(&mut ti, &mut questions, &[], 2.5, "late start", 2, at(5)).unwrap();
        assert_eq!(ti.state, InstanceState::Finished);
        assert_eq!(ti.ended_at, Some(at(5)));
        assert_eq!(ti.bonus_points, 2.5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BonusPoints);

        let unchanged =
            tutor_finish(&mut ti, &mut questions, &[], 2.5, "late start", 2, at(6)).unwrap();
        assert!(unchanged.is_empty());
        assert_eq!(ti.ended_at, Some(at(5)));
    }
}
