//! Core building blocks for 2D pose-graph optimization
//!
//! This module contains the data model and the least-squares problem formulation:
//! - Poses, constraints and angle normalization
//! - The pose graph with its flat parameter store
//! - Residual blocks and the problem they form
//! - Loss functions for robust estimation
//! - Correctors for applying loss functions

pub mod corrector;
pub mod graph;
pub mod loss_functions;
pub mod pose;
pub mod problem;
pub mod residual_block;
