// Free-list object pool for per-tick rebuilt structures.
//
// Objects live in one contiguous arena and are addressed by `PoolHandle`
// (an index), so "releasing" an object is just pushing its index onto the
// free list. A released handle is recycled as-is: the pool never resets the
// object, callers must overwrite every field they read.

/// Index of a pooled object. Only meaningful for the pool that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(u32);

impl PoolHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct ObjectPool<T> {
    storage: Vec<T>,
    available: Vec<PoolHandle>,
}

impl<T: Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> ObjectPool<T> {
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            available: Vec::new(),
        }
    }

    /// Pre-allocates room for `capacity` objects without creating any.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Vec::with_capacity(capacity),
            available: Vec::with_capacity(capacity),
        }
    }

    /// Hands out a recycled object if one is available, otherwise grows the
    /// arena with a freshly defaulted one.
    pub fn take(&mut self) -> PoolHandle {
        if let Some(handle) = self.available.pop() {
            return handle;
        }

        let handle = PoolHandle(self.storage.len() as u32);
        self.storage.push(T::default());
        handle
    }

    /// Returns an object to the free list. `None` is reported and ignored.
    pub fn release(&mut self, handle: Option<PoolHandle>) {
        let Some(handle) = handle else {
            log::error!(target: "spatial", "ObjectPool::release called with an empty handle");
            return;
        };
        self.available.push(handle);
    }

    /// Drops every object the pool owns, checked out or not. Outstanding
    /// handles become dangling and must not be used afterwards.
    pub fn clear_pool(&mut self) {
        self.available.clear();
        self.storage.clear();
    }

    /// Objects sitting on the free list.
    pub fn num_available(&self) -> usize {
        self.available.len()
    }

    /// Objects ever created and still owned by the arena.
    pub fn num_allocated(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn get(&self, handle: PoolHandle) -> Option<&T> {
        self.storage.get(handle.index())
    }

    #[inline]
    pub fn get_mut(&mut self, handle: PoolHandle) -> Option<&mut T> {
        self.storage.get_mut(handle.index())
    }
}
