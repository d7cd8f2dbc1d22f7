//! Cross-chain inventory management: deciding when destination-chain funds
//! fall short of an invoice's requirement, moving funds from richer chains
//! over third-party bridges and exchanges, and driving each transfer to
//! completion on the destination side.

pub mod balances;
pub mod callback;
pub mod executor;
pub mod planner;
pub mod swap;
