//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the job queue.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Represents a pending job record in the `background_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct QueuedJob {
    /// Unique identifier for the job instance
    pub id: i64,
    /// Job kind identifier (used for dispatch)
    pub job_type: String,
    /// JSON data containing the job payload
    pub data: Value,
    /// The attempt about to run, starting at 1
    pub attempt: i32,
    /// Retry budget copied from the kind's policy at enqueue time
    pub max_attempts: i32,
    /// Dequeue priority (higher runs first)
    pub priority: i16,
    /// Timestamp when the job was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued
    pub not_before_at: DateTime<Utc>,
    /// Error message from the most recent failed attempt
    pub last_error: Option<String>,
}

/// Represents a permanently failed job record in the `dead_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct DeadJob {
    /// Identifier the job carried while queued
    pub id: i64,
    /// Job kind identifier
    pub job_type: String,
    /// JSON data containing the job payload
    pub data: Value,
    /// The attempt count when the retry budget ran out
    pub attempt: i32,
    /// Retry budget the instance was enqueued with
    pub max_attempts: i32,
    /// Dequeue priority the instance carried
    pub priority: i16,
    /// Timestamp when the job was originally enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Error message from the final failed attempt
    pub final_error: String,
    /// Timestamp when the job was dead-lettered
    pub dead_at: DateTime<Utc>,
}
