#![allow(clippy::cast_precision_loss)]

mod expressions;
mod sampling;
