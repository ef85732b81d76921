use crate::jobstatus::{from_pbs, from_slurm, JobStatus};

#[test]
fn slurm_vocabulary_maps_onto_internal_states() {
    assert_eq!(from_slurm("PENDING"), Some(JobStatus::Pending));
    assert_eq!(from_slurm("PD"), Some(JobStatus::Pending));
    assert_eq!(from_slurm("RUNNING"), Some(JobStatus::Running));
    assert_eq!(from_slurm("COMPLETED"), Some(JobStatus::Completed));
    assert_eq!(from_slurm("CANCELLED"), Some(JobStatus::Cancelled));
    assert_eq!(from_slurm("TIMEOUT"), Some(JobStatus::Failed));
    assert_eq!(from_slurm("NODE_FAIL"), Some(JobStatus::Failed));
}

#[test]
fn completing_is_still_running() {
    // a job draining through the epilog must not look terminal
    assert_eq!(from_slurm("CG"), Some(JobStatus::Running));
    assert_eq!(from_slurm("COMPLETING"), Some(JobStatus::Running));
    assert!(!from_slurm("CG").unwrap().is_terminal());
}

#[test]
fn slurm_lookup_is_case_insensitive_and_trimmed() {
    assert_eq!(from_slurm(" cg "), Some(JobStatus::Running));
    assert_eq!(from_slurm("completed"), Some(JobStatus::Completed));
}

#[test]
fn unknown_vocabulary_is_not_guessed() {
    assert_eq!(from_slurm("SPECIAL_EXIT"), None);
    assert_eq!(from_pbs("Z"), None);
}

#[test]
fn pbs_vocabulary_maps_onto_internal_states() {
    assert_eq!(from_pbs("Q"), Some(JobStatus::Pending));
    assert_eq!(from_pbs("H"), Some(JobStatus::Pending));
    assert_eq!(from_pbs("R"), Some(JobStatus::Running));
    // E is exiting, not yet done
    assert_eq!(from_pbs("E"), Some(JobStatus::Running));
    assert_eq!(from_pbs("C"), Some(JobStatus::Completed));
}

#[test]
fn exactly_three_states_are_terminal() {
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Cancelled.is_terminal());
    assert!(!JobStatus::Valid.is_terminal());
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
}
