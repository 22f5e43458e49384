use pakstream_base::SymbolIndex;
use std::error::Error;

/// Opaque reference to an object owned by the engine's object model. The
/// loader never dereferences these, it only threads them between the factory,
/// the symbol tables and the finalizer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    pub fn null() -> Self {
        ObjectRef(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Interned name handle, allocated by [`ObjectFactory::resolve_or_intern_name`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NameHandle(pub u64);

/// Everything the factory needs to allocate one export object. The class,
/// outer and template references have already been resolved through the
/// symbol table; any of them may be null if the corresponding symbol degraded.
#[derive(Debug)]
pub struct ObjectSpawnDesc {
    pub name: NameHandle,
    pub class: ObjectRef,
    pub outer: ObjectRef,
    pub template: ObjectRef,
}

/// Resolves symbol indices to object references while a payload is being
/// deserialized. Backed by the owning task's export and import object slots.
pub struct ResolvedReferences<'a> {
    exports: &'a [ObjectRef],
    imports: &'a [ObjectRef],
}

impl<'a> ResolvedReferences<'a> {
    pub fn new(
        exports: &'a [ObjectRef],
        imports: &'a [ObjectRef],
    ) -> Self {
        ResolvedReferences { exports, imports }
    }

    /// Returns the object a symbol index refers to, or null for the null
    /// index, an out-of-range index or a symbol that failed to resolve.
    pub fn resolve(
        &self,
        index: SymbolIndex,
    ) -> ObjectRef {
        if let Some(i) = index.export_index() {
            self.exports.get(i).copied().unwrap_or_else(ObjectRef::null)
        } else if let Some(i) = index.import_index() {
            self.imports.get(i).copied().unwrap_or_else(ObjectRef::null)
        } else {
            ObjectRef::null()
        }
    }
}

/// Worker-thread side of the object model collaborator.
///
/// The loader calls this to construct objects and push payload bytes into
/// them. Everything here runs on the thread that ticks the scheduler, so the
/// implementation is the bridge to whatever thread-affinity rules the engine's
/// object system has for construction.
pub trait ObjectFactory: Send {
    /// Intern a name, returning a stable handle for it.
    fn resolve_or_intern_name(
        &mut self,
        text: &str,
    ) -> NameHandle;

    /// Allocate and default-initialize one object.
    fn allocate_object(
        &mut self,
        desc: &ObjectSpawnDesc,
    ) -> ObjectRef;

    /// Deserialize an object's payload bytes. Cross-references inside the
    /// payload are resolved through `refs`.
    fn deserialize_object(
        &mut self,
        object: ObjectRef,
        payload: &[u8],
        refs: &ResolvedReferences<'_>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Guard `object` against the collector for the lifetime of the owning
    /// task. Released by [`ObjectFinalizer::clear_loader_flags`].
    fn mark_reachable_while_loading(
        &mut self,
        object: ObjectRef,
    );

    /// Whether a class object has finished its own load and can safely back
    /// new instances. False means the loader must defer construction until
    /// the class's payload has been serialized.
    fn is_class_fully_formed(
        &self,
        class: ObjectRef,
    ) -> bool;

    /// Look up an object already resident in memory, e.g. from a previous
    /// load. `class_name` may be empty when any class is acceptable.
    fn find_existing_object(
        &self,
        class_name: &str,
        package: &str,
        name: &str,
    ) -> Option<ObjectRef>;
}

/// Calling-thread side of the object model collaborator. These are the
/// operations that must not run off the thread that owns the live object
/// graph.
pub trait ObjectFinalizer {
    /// Run arbitrary post-construction fixup on one object.
    fn post_deserialize_fixup(
        &mut self,
        object: ObjectRef,
    );

    /// Clear the loader-only flags set during construction, making the object
    /// visible to normal lookup and releasing the collector guard.
    fn clear_loader_flags(
        &mut self,
        object: ObjectRef,
    );

    /// Flag an object from a failed load so it is excluded from normal lookup
    /// and eligible for cleanup by the collector.
    fn mark_load_failed(
        &mut self,
        object: ObjectRef,
    );
}
