//! 矿机通信协议底层实现

pub mod cgminer;
pub mod digest;

pub use cgminer::{parse_response, CgminerClient};
pub use digest::DigestChallenge;
