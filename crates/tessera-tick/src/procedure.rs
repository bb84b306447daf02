//! Procedures: units of work run by the schedule.
//!
//! A procedure is usually a plain function whose parameters are drawn
//! from the [`ProcedureParam`] catalog:
//!
//! ```ignore
//! fn integrate(mut query: Query<(&mut Position, &Velocity)>, time: Res<Time>) {
//!     for (pos, vel) in query.iter_mut() {
//!         pos.x += vel.x * time.delta;
//!     }
//! }
//!
//! schedule.add_procedure(stage::UPDATE, integrate);
//! ```
//!
//! Parameters are analyzed once, when the procedure is initialized; each
//! run only replays the cached parameter states.

use std::{any::type_name, marker::PhantomData};

use tessera_ecs::{Access, World};

use crate::{
    error::{TickError, TickResult},
    param::{Args, ParamItem, ProcedureParam},
};

/// Name and accumulated access of a procedure, filled in by its parameters.
#[derive(Debug, Clone)]
pub struct ProcedureMeta {
    name: &'static str,
    access: Access,
}

impl ProcedureMeta {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            access: Access::new(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn access(&self) -> &Access {
        &self.access
    }

    /// Record access through `f`, naming this procedure in any conflict.
    pub fn record<F>(&mut self, f: F) -> TickResult<()>
    where
        F: FnOnce(&mut Access) -> Result<(), tessera_ecs::AccessConflict>,
    {
        f(&mut self.access).map_err(|conflict| TickError::ConflictingAccess {
            procedure: self.name,
            conflict,
        })
    }

    pub(crate) fn set_exclusive(&mut self) {
        self.access.set_exclusive();
    }
}

/// A type-erased unit of work.
pub trait Procedure: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Everything this procedure reads or writes. Meaningful once initialized.
    fn access(&self) -> &Access;

    fn is_initialized(&self) -> bool;

    /// Resolve parameters against `world`. Idempotent.
    fn initialize(&mut self, world: &mut World) -> TickResult<()>;

    /// Run to completion, then apply any deferred work.
    fn run(&mut self, world: &mut World, args: &Args) -> TickResult<()>;
}

/// Return types a procedure may have.
pub trait ProcedureOutput {
    fn into_result(self) -> TickResult<()>;
}

impl ProcedureOutput for () {
    fn into_result(self) -> TickResult<()> {
        Ok(())
    }
}

impl<E: Into<TickError>> ProcedureOutput for Result<(), E> {
    fn into_result(self) -> TickResult<()> {
        self.map_err(Into::into)
    }
}

/// Functions whose every argument is a [`ProcedureParam`].
///
/// `Marker` only disambiguates the blanket impls per arity.
pub trait ProcedureFn<Marker>: Send + Sync + 'static {
    type Param: ProcedureParam;
    type Output: ProcedureOutput;

    fn call(&mut self, params: ParamItem<'_, '_, Self::Param>) -> Self::Output;
}

macro_rules! impl_procedure_fn {
    ($($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<Out, Func, $($P: ProcedureParam),*> ProcedureFn<fn($($P,)*) -> Out> for Func
        where
            Func: Send + Sync + 'static,
            for<'a> &'a mut Func:
                FnMut($($P),*) -> Out +
                FnMut($(ParamItem<'_, '_, $P>),*) -> Out,
            Out: ProcedureOutput,
        {
            type Param = ($($P,)*);
            type Output = Out;

            fn call(&mut self, params: ParamItem<'_, '_, ($($P,)*)>) -> Out {
                // Pins the argument types so the HRTB above is picked.
                #[allow(clippy::too_many_arguments)]
                fn call_inner<Out, $($P,)*>(mut f: impl FnMut($($P,)*) -> Out, $($P: $P,)*) -> Out {
                    f($($P,)*)
                }
                let ($($P,)*) = params;
                call_inner(self, $($P),*)
            }
        }
    };
}

impl_procedure_fn!();
impl_procedure_fn!(A);
impl_procedure_fn!(A, B);
impl_procedure_fn!(A, B, C);
impl_procedure_fn!(A, B, C, D);
impl_procedure_fn!(A, B, C, D, E);
impl_procedure_fn!(A, B, C, D, E, F);
impl_procedure_fn!(A, B, C, D, E, F, G);
impl_procedure_fn!(A, B, C, D, E, F, G, H);

/// A [`ProcedureFn`] plus its cached parameter state.
pub struct FunctionProcedure<Marker, F: ProcedureFn<Marker>> {
    func: F,
    state: Option<<F::Param as ProcedureParam>::State>,
    meta: ProcedureMeta,
    _marker: PhantomData<fn() -> Marker>,
}

impl<Marker, F: ProcedureFn<Marker>> FunctionProcedure<Marker, F> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            state: None,
            meta: ProcedureMeta::new(type_name::<F>()),
            _marker: PhantomData,
        }
    }
}

impl<Marker: 'static, F: ProcedureFn<Marker>> Procedure for FunctionProcedure<Marker, F> {
    fn name(&self) -> &'static str {
        self.meta.name
    }

    fn access(&self) -> &Access {
        &self.meta.access
    }

    fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn initialize(&mut self, world: &mut World) -> TickResult<()> {
        if self.state.is_none() {
            let mut meta = ProcedureMeta::new(self.meta.name);
            self.state = Some(F::Param::analyze(world, &mut meta)?);
            self.meta = meta;
        }
        Ok(())
    }

    fn run(&mut self, world: &mut World, args: &Args) -> TickResult<()> {
        let state = self
            .state
            .as_mut()
            .ok_or(TickError::Uninitialized(self.meta.name))?;

        // SAFETY: analyze rejected self-aliasing parameters, and `&mut World`
        // keeps every other procedure out for the duration of the call
        let params = unsafe { F::Param::apply(state, world, args)? };
        let output = self.func.call(params);

        // Deferred work is applied even when the procedure failed.
        F::Param::flush(state, world)?;
        output.into_result()
    }
}

/// A procedure with direct `&mut World` access.
///
/// Runs alone; its structural changes are immediate.
pub struct ExclusiveProcedure<F, Out> {
    func: F,
    meta: ProcedureMeta,
    _marker: PhantomData<fn() -> Out>,
}

impl<F, Out> ExclusiveProcedure<F, Out>
where
    F: FnMut(&mut World) -> Out + Send + Sync + 'static,
    Out: ProcedureOutput + 'static,
{
    pub fn new(func: F) -> Self {
        let mut meta = ProcedureMeta::new(type_name::<F>());
        meta.set_exclusive();
        Self {
            func,
            meta,
            _marker: PhantomData,
        }
    }
}

impl<F, Out> Procedure for ExclusiveProcedure<F, Out>
where
    F: FnMut(&mut World) -> Out + Send + Sync + 'static,
    Out: ProcedureOutput + 'static,
{
    fn name(&self) -> &'static str {
        self.meta.name
    }

    fn access(&self) -> &Access {
        &self.meta.access
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn initialize(&mut self, _world: &mut World) -> TickResult<()> {
        Ok(())
    }

    fn run(&mut self, world: &mut World, _args: &Args) -> TickResult<()> {
        (self.func)(world).into_result()
    }
}

/// Conversion into a boxed-able [`Procedure`].
pub trait IntoProcedure<Marker> {
    type Procedure: Procedure;

    fn into_procedure(self) -> Self::Procedure;
}

#[doc(hidden)]
pub struct IsFunction;

#[doc(hidden)]
pub struct IsProcedure;

impl<Marker: 'static, F: ProcedureFn<Marker>> IntoProcedure<(IsFunction, Marker)> for F {
    type Procedure = FunctionProcedure<Marker, F>;

    fn into_procedure(self) -> Self::Procedure {
        FunctionProcedure::new(self)
    }
}

impl<P: Procedure> IntoProcedure<IsProcedure> for P {
    type Procedure = P;

    fn into_procedure(self) -> P {
        self
    }
}
