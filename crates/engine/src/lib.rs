//! Request-side notification logic: the reply policy, the moderation flow
//! that drives it, and the persistence collaborator both read from.

pub mod html;
pub mod moderation;
pub mod reply_policy;
pub mod repository;
