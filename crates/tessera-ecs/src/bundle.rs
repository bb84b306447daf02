//! Bundles: groups of components inserted together.
//!
//! Spawning a bundle places the entity straight into its final
//! archetype instead of migrating once per component.

use smallvec::SmallVec;

use crate::component::{Component, ComponentId, ComponentRegistry};

/// A statically known set of components.
///
/// # Safety
///
/// `take` must yield exactly one pointer per id pushed by `register`, in
/// the same order, each pointing at a valid value of the registered type
/// whose ownership passes to the callee.
pub unsafe trait Bundle: Send + Sync + 'static {
    /// Register every component type and push its id in declaration order.
    fn register(registry: &mut ComponentRegistry, ids: &mut SmallVec<[ComponentId; 8]>);

    /// Hand each component's bytes to `f`, in declaration order.
    fn take(self, f: &mut dyn FnMut(*const u8));
}

macro_rules! impl_bundle {
    ($($name:ident),*) => {
        // SAFETY: one id and one pointer per tuple element, same order
        unsafe impl<$($name: Component),*> Bundle for ($($name,)*) {
            fn register(registry: &mut ComponentRegistry, ids: &mut SmallVec<[ComponentId; 8]>) {
                $(ids.push(registry.register::<$name>());)*
            }

            #[allow(non_snake_case)]
            fn take(self, f: &mut dyn FnMut(*const u8)) {
                let ($($name,)*) = self;
                $(
                    let $name = std::mem::ManuallyDrop::new($name);
                    f(std::ptr::from_ref::<$name>(&$name).cast());
                )*
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

/// First id that appears twice in `ids`, if any.
pub(crate) fn find_duplicate(ids: &[ComponentId]) -> Option<ComponentId> {
    let mut sorted: SmallVec<[ComponentId; 8]> = ids.iter().copied().collect();
    sorted.sort_unstable();
    sorted.windows(2).find(|w| w[0] == w[1]).map(|w| w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B(u32);

    #[test]
    fn test_register_order_matches_take_order() {
        let mut registry = ComponentRegistry::new();
        let mut ids = SmallVec::new();
        <(B, A) as Bundle>::register(&mut registry, &mut ids);

        assert_eq!(ids.as_slice(), &[registry.get_id::<B>().unwrap(), registry.get_id::<A>().unwrap()]);

        let mut seen = 0;
        (B(7), A).take(&mut |ptr| {
            if seen == 0 {
                assert_eq!(unsafe { (*ptr.cast::<B>()).0 }, 7);
            }
            seen += 1;
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_find_duplicate() {
        let a = ComponentId::from_raw(1);
        let b = ComponentId::from_raw(2);

        assert_eq!(find_duplicate(&[a, b]), None);
        assert_eq!(find_duplicate(&[b, a, b]), Some(b));
    }
}
