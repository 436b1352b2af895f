pub mod strategies;

pub use strategies::{
    MatchLabel, StrategyInput, StrategyKind, StrategyOutcome, apply_strategy,
};
