#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! Tessera Tick
//!
//! Stage-ordered execution of procedures over a [`World`](tessera_ecs::World).
//!
//! # Execution Model
//!
//! ```text
//! run_stages(low, high):
//! ┌─────────────────────────────────────────────────────────────┐
//! │  for each stage with low <= id <= high, ascending:           │
//! │    STATE_TRANSITION: apply every pending NextState           │
//! │    gated stage: apply its state's pending NextState, check   │
//! │    for each procedure, in registration order:                │
//! │      apply params -> call -> flush Commands                  │
//! │      first error: abort the run                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on the calling thread. A procedure runs to completion
//! before the next one starts, and its changes are visible to the next.
//!
//! # Parameters
//!
//! Procedure arguments come from an open catalog ([`ProcedureParam`]):
//! [`Query`], [`Res`](tessera_ecs::Res), [`ResMut`](tessera_ecs::ResMut),
//! [`Local`], [`EventReader`], [`EventWriter`], [`Relations`], [`Arg`]
//! and [`Commands`]. Each kind is analyzed once when the procedure is
//! initialized and applied on every run.

mod commands;
mod error;
mod param;
mod procedure;
mod schedule;
pub mod stage;
mod state;
mod world_ext;

pub use commands::{CommandQueue, Commands};
pub use error::{TickError, TickResult};
pub use param::{Arg, Args, EventReader, EventWriter, Local, ParamItem, ProcedureParam, Query, Relations};
pub use procedure::{
    ExclusiveProcedure, FunctionProcedure, IntoProcedure, Procedure, ProcedureFn, ProcedureMeta,
    ProcedureOutput,
};
pub use schedule::{Schedule, ScheduleConfig};
pub use stage::{StageId, StageLabel};
pub use state::{NextState, State, States};
pub use world_ext::ScheduleWorldExt;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Arg, Args, Commands, EventReader, EventWriter, Local, NextState, Query, Relations,
        Schedule, ScheduleWorldExt, StageId, State, TickError, TickResult, stage,
    };
}
