pub mod purge_old_runs;
