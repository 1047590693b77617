pub mod attention;
pub mod config;
pub mod ctc;
pub mod decoder;
pub mod error;
pub mod lm;
pub mod observer;
pub mod session;

mod beam;
mod layers;

pub use beam::ScoreBreakdown;
pub use decoder::beam_search::{DecodedHypothesis, EnsembleMember, RecogResources};
pub use decoder::greedy::GreedyHypothesis;
pub use decoder::loss::{LossOutput, Task, TrainBatch};
pub use decoder::streaming::{ChunkResult, ChunkSyncDecoder, StreamHypothesis};
pub use decoder::{DecoderState, RnnDecoder};
pub use error::DecodeError;
pub use session::SessionContext;
