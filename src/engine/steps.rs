use crate::models::template::StepSelection;

/// Whether a question tagged with `question_steps` passes a segment's step filter.
pub fn question_meets_steps(question_steps: &[i64], required: &[i64], mode: StepSelection) -> bool {
    let uses = |step: &i64| question_steps.contains(step);
    let selected = |step: &i64| required.contains(step);

    match mode {
        StepSelection::Nc => {
            question_steps.len() == required.len() && required.iter().all(uses)
        }
        StepSelection::Nd => {
            question_steps.iter().all(selected) && required.iter().any(uses)
        }
        StepSelection::Sc => required.iter().all(uses),
        StepSelection::Sd => required.iter().any(uses),
    }
}
