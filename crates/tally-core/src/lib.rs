pub mod index;
pub mod model;
pub mod net;
pub mod output;
pub mod pipeline;
pub mod reconcile;
pub mod runs;
pub mod storage;
