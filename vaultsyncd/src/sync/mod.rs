pub mod decision;
pub mod merge;
pub mod metadata;
pub mod paths;
pub mod plan;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod stages;
