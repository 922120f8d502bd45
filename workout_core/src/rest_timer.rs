//! Inter-set rest and next-set planning for routines.
//!
//! Routine traversal:
//! - outside a superset, every set of an exercise runs before the next exercise;
//! - inside a superset group (consecutive exercises sharing a group id), the sets
//!   alternate between the group's exercises with the group's shorter rest, and the
//!   exercise's own rest applies when the round wraps to the next set index.

use crate::types::{Exercise, Routine, SupersetInfo, WorkoutParameters};

/// Index of a set within a routine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SetPosition {
    pub exercise: usize,
    pub set: usize,
}

/// Everything needed to start the upcoming set
#[derive(Clone, Debug, PartialEq)]
pub struct NextSetPlan {
    pub position: SetPosition,
    pub exercise: Exercise,
    pub params: WorkoutParameters,
    pub rest_secs: u32,
    pub label: String,
    pub is_last_exercise: bool,
    pub superset: Option<SupersetInfo>,
}

/// Outcome of one rest-timer tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestTick {
    Counting(u32),
    Finished { auto_advance: bool },
    /// Already at zero, waiting for the user
    Holding,
}

#[derive(Clone, Debug, Default)]
pub struct RestTimerController {
    remaining_secs: u32,
    autoplay: bool,
    plan: Option<NextSetPlan>,
    edited: Option<WorkoutParameters>,
}

impl RestTimerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where a routine starts: the first set of the first exercise that has sets
    pub fn first_position(routine: &Routine) -> Option<SetPosition> {
        first_set_from(routine, 0)
    }

    /// Work out the set that follows `current`, or `None` when the routine is done
    pub fn plan_next(routine: &Routine, current: SetPosition) -> Option<NextSetPlan> {
        let exercises = &routine.exercises;
        let here = exercises.get(current.exercise)?;
        let own_rest = here.rest_secs;

        let (position, rest_secs) = match group_bounds(routine, current.exercise) {
            Some((start, end)) => {
                let inherited = here
                    .superset
                    .as_ref()
                    .map_or(own_rest, |g| g.rest_secs.min(own_rest));
                let same_round = (current.exercise + 1..=end)
                    .find(|&i| exercises[i].sets.len() > current.set)
                    .map(|i| SetPosition {
                        exercise: i,
                        set: current.set,
                    });
                match same_round {
                    Some(pos) => (pos, inherited),
                    None => {
                        let next_round = (start..=end)
                            .find(|&i| exercises[i].sets.len() > current.set + 1)
                            .map(|i| SetPosition {
                                exercise: i,
                                set: current.set + 1,
                            });
                        (next_round.or_else(|| first_set_from(routine, end + 1))?, own_rest)
                    }
                }
            }
            None => {
                let pos = if here.sets.len() > current.set + 1 {
                    SetPosition {
                        exercise: current.exercise,
                        set: current.set + 1,
                    }
                } else {
                    first_set_from(routine, current.exercise + 1)?
                };
                (pos, own_rest)
            }
        };

        let next = &exercises[position.exercise];
        let params = next.params_for_set(position.set)?;
        let label = format!(
            "{} - set {}/{} @ {:.1} kg",
            next.exercise.name,
            position.set + 1,
            next.sets.len(),
            params.weight_per_cable_kg
        );

        Some(NextSetPlan {
            position,
            exercise: next.exercise.clone(),
            params,
            rest_secs,
            label,
            is_last_exercise: position.exercise + 1 == exercises.len(),
            superset: superset_info(routine, position.exercise),
        })
    }

    /// Start counting down towards `plan`
    pub fn begin(&mut self, plan: NextSetPlan, autoplay: bool) {
        tracing::debug!("Rest {}s before {}", plan.rest_secs, plan.label);
        self.remaining_secs = plan.rest_secs;
        self.autoplay = autoplay;
        self.plan = Some(plan);
        self.edited = None;
    }

    pub fn tick(&mut self) -> RestTick {
        if self.remaining_secs == 0 {
            return RestTick::Holding;
        }
        self.remaining_secs -= 1;
        if self.remaining_secs == 0 {
            RestTick::Finished {
                auto_advance: self.autoplay,
            }
        } else {
            RestTick::Counting(self.remaining_secs)
        }
    }

    pub fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    pub fn plan(&self) -> Option<&NextSetPlan> {
        self.plan.as_ref()
    }

    /// Parameters the next set will use: the user's edit if any, else the template
    pub fn pending_params(&self) -> Option<&WorkoutParameters> {
        self.edited
            .as_ref()
            .or_else(|| self.plan.as_ref().map(|p| &p.params))
    }

    /// Record a user edit made during rest; it wins over the template
    pub fn apply_edit(&mut self, params: WorkoutParameters) {
        self.edited = Some(params);
    }

    pub fn is_edited(&self) -> bool {
        self.edited.is_some()
    }

    /// Hand over the next set, ending the rest period
    pub fn take_next(&mut self) -> Option<NextSetPlan> {
        let mut plan = self.plan.take()?;
        if let Some(edit) = self.edited.take() {
            plan.params = edit;
        }
        self.remaining_secs = 0;
        Some(plan)
    }

    pub fn cancel(&mut self) {
        self.remaining_secs = 0;
        self.plan = None;
        self.edited = None;
    }
}

/// First set of the first exercise at or after `from` that has any sets
fn first_set_from(routine: &Routine, from: usize) -> Option<SetPosition> {
    (from..routine.exercises.len())
        .find(|&i| !routine.exercises[i].sets.is_empty())
        .map(|i| SetPosition { exercise: i, set: 0 })
}

/// Bounds of the superset group containing `index`, if it has more than one member
fn group_bounds(routine: &Routine, index: usize) -> Option<(usize, usize)> {
    let exercises = &routine.exercises;
    let id = exercises.get(index)?.superset_id()?;

    let mut start = index;
    while start > 0 && exercises[start - 1].superset_id() == Some(id) {
        start -= 1;
    }
    let mut end = index;
    while end + 1 < exercises.len() && exercises[end + 1].superset_id() == Some(id) {
        end += 1;
    }
    (end > start).then_some((start, end))
}

fn superset_info(routine: &Routine, index: usize) -> Option<SupersetInfo> {
    let (start, end) = group_bounds(routine, index)?;
    let group_id = routine.exercises[index].superset_id()?.to_string();
    Some(SupersetInfo {
        group_id,
        position: index - start + 1,
        size: end - start + 1,
    })
}
