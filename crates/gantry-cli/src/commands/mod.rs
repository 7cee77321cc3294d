pub mod cancel;
pub mod check;
pub mod plan;
pub mod run;
pub mod runs;
