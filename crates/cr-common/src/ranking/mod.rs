pub mod pipeline;

pub use pipeline::{
    CandidateSource, CandidateSourceError, RankPage, RankRequest, RankedResult, RankingEngine,
    RankingError,
};
