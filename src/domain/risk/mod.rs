// Risk assessment domain
pub mod correlation;
pub mod sizing;
pub mod trailing;
pub mod volatility;
