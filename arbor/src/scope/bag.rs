//! A type map for opaque user state.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Provides storage for user state, one item of each type.
///
/// Values are held behind `Arc`, so cloning a `Bag` shares the values by reference while the
/// map itself is copied; inserting into a clone never changes the source.
#[derive(Clone, Default)]
pub struct Bag {
    data: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Bag {
    /// Creates a new, empty `Bag`.
    pub fn new() -> Bag {
        Bag::default()
    }

    /// Puts a value into storage. One value of each type is retained; successive calls to
    /// `put` overwrite the existing value of the same type.
    pub fn put<T>(&mut self, t: T)
    where
        T: Any + Send + Sync,
    {
        self.data.insert(TypeId::of::<T>(), Arc::new(t));
    }

    /// Determines whether a value of the given type is present.
    pub fn has<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.data.contains_key(&TypeId::of::<T>())
    }

    /// Retrieves a shared handle to the value of the given type, if present.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.data
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Removes the value of the given type and returns its handle.
    pub fn remove<T>(&mut self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.data
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MyStruct {
        value: i32,
    }

    struct AnotherStruct;

    #[test]
    fn put_borrow_and_overwrite() {
        let mut bag = Bag::new();

        bag.put(MyStruct { value: 1 });
        assert_eq!(bag.get::<MyStruct>().unwrap().value, 1);
        assert!(!bag.has::<AnotherStruct>());

        bag.put(MyStruct { value: 100 });
        assert_eq!(bag.get::<MyStruct>().unwrap().value, 100);
    }

    #[test]
    fn clones_share_values_by_reference() {
        let mut bag = Bag::new();
        bag.put(MyStruct { value: 7 });

        let cloned = bag.clone();
        assert!(Arc::ptr_eq(
            &bag.get::<MyStruct>().unwrap(),
            &cloned.get::<MyStruct>().unwrap()
        ));
    }

    #[test]
    fn inserting_into_a_clone_does_not_change_the_source() {
        let bag = Bag::new();
        let mut cloned = bag.clone();
        cloned.put(AnotherStruct);

        assert!(!bag.has::<AnotherStruct>());
        assert!(cloned.has::<AnotherStruct>());
    }

    #[test]
    fn remove_takes_the_value_out() {
        let mut bag = Bag::new();
        bag.put(MyStruct { value: 3 });
        assert_eq!(bag.remove::<MyStruct>().unwrap().value, 3);
        assert!(!bag.has::<MyStruct>());
    }
}
