// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Implementation-module loading.
//!
//! The store front-end and the codec implementation live in separate
//! objects. The implementation module exports a C ABI pair,
//! `CreateFactory`/`DestroyFactory`, producing an opaque factory the store
//! drives through [`ComponentFactory`]. The module is loaded on first use
//! and stays mapped for as long as any component or the store itself holds
//! it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::component::ComponentFactory;
use crate::error::C2Error;
use crate::error::C2Result;
use crate::registry::ComponentEntry;
use crate::registry::Domain;
use crate::registry::Kind;

/// Default implementation-module name, resolved through the system linker
/// search path.
pub const COMPONENT_MODULE: &str = "libcodec2_rk_component.so";

const RANK_AUDIO: u32 = 8;
const RANK_DEFAULT: u32 = 128;

/// Host-visible description of one component. Derived from the registry
/// entry by the implementation module's factory, so describing a component
/// never instantiates its codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentTraits {
    pub name: String,
    pub mime: String,
    pub kind: Kind,
    pub domain: Domain,
    /// Selection priority; lower wins against other stores.
    pub rank: u32,
    pub aliases: Vec<String>,
}

impl ComponentTraits {
    pub fn for_entry(entry: &ComponentEntry) -> Self {
        let domain = match entry.mime.split('/').next() {
            Some("audio") => Domain::Audio,
            Some("video") => Domain::Video,
            Some("image") => Domain::Image,
            _ => Domain::Other,
        };
        let rank = if domain == Domain::Audio { RANK_AUDIO } else { RANK_DEFAULT };
        Self {
            name: entry.name.to_string(),
            mime: entry.mime.to_string(),
            kind: entry.kind,
            domain,
            rank,
            aliases: entry
                .aliases
                .split(',')
                .filter(|alias| !alias.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

type CreateFactoryFn = unsafe extern "C" fn() -> *mut c_void;
type DestroyFactoryFn = unsafe extern "C" fn(*mut c_void);

/// A factory obtained over the C ABI. The opaque pointer is a
/// `Box<Box<dyn ComponentFactory>>` allocated by the module; it must go
/// back through the module's destroy entry point, not through our
/// allocator.
struct ForeignFactory {
    raw: *mut c_void,
    destroy: DestroyFactoryFn,
}

impl ForeignFactory {
    fn get(&self) -> &dyn ComponentFactory {
        // Validity of the pointer is established at load time and the
        // module stays mapped while self is alive.
        unsafe { &**(self.raw as *mut Box<dyn ComponentFactory>) }
    }
}

impl Drop for ForeignFactory {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.raw) }
    }
}

// The pointee is a ComponentFactory, which is Send + Sync by trait bound.
unsafe impl Send for ForeignFactory {}
unsafe impl Sync for ForeignFactory {}

enum ModuleFactory {
    InProcess(Box<dyn ComponentFactory>),
    // Field order matters: the factory must drop before the library that
    // holds its code is unmapped.
    Foreign(ForeignFactory, libloading::Library),
}

/// A loaded implementation module and its factory. Components keep an
/// `Arc` of this so the library outlives every codec instance.
pub struct ComponentModule {
    factory: ModuleFactory,
    /// Traits are asked of the factory once per name and kept for the
    /// lifetime of the module.
    traits: Mutex<HashMap<String, Arc<ComponentTraits>>>,
}

impl ComponentModule {
    fn with_factory(factory: ModuleFactory) -> Self {
        Self { factory, traits: Mutex::new(HashMap::new()) }
    }

    pub fn in_process(factory: Box<dyn ComponentFactory>) -> Self {
        Self::with_factory(ModuleFactory::InProcess(factory))
    }

    pub fn factory(&self) -> &dyn ComponentFactory {
        match &self.factory {
            ModuleFactory::InProcess(factory) => factory.as_ref(),
            ModuleFactory::Foreign(factory, _) => factory.get(),
        }
    }

    /// Cached traits lookup through the module's factory.
    pub fn traits(&self, name: &str) -> C2Result<Arc<ComponentTraits>> {
        let mut cache = self.traits.lock().unwrap();
        if let Some(traits) = cache.get(name) {
            return Ok(traits.clone());
        }
        let traits = Arc::new(self.factory().component_traits(name)?);
        cache.insert(name.to_string(), traits.clone());
        Ok(traits)
    }
}

/// Source of the implementation module; swappable so tests can inject an
/// in-process factory instead of dlopening a vendor object.
pub trait LoaderBackend: Send + Sync {
    fn load(&self) -> C2Result<ComponentModule>;
}

/// Production backend: dlopen the vendor module and resolve its factory
/// entry points. A module that cannot be loaded or lacks the entry points
/// is a deploy-time misconfiguration; it aborts rather than limping along
/// with no codecs.
pub struct DylibLoader {
    path: String,
}

impl DylibLoader {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new(COMPONENT_MODULE)
    }
}

impl LoaderBackend for DylibLoader {
    fn load(&self) -> C2Result<ComponentModule> {
        let library = unsafe { libloading::Library::new(&self.path) }
            .unwrap_or_else(|err| panic!("failed to load {}: {err}", self.path));

        let (create, destroy) = unsafe {
            let create = library
                .get::<CreateFactoryFn>(b"CreateFactory\0")
                .unwrap_or_else(|err| panic!("{} has no CreateFactory: {err}", self.path))
                .into_raw();
            let destroy = library
                .get::<DestroyFactoryFn>(b"DestroyFactory\0")
                .unwrap_or_else(|err| panic!("{} has no DestroyFactory: {err}", self.path))
                .into_raw();
            (*create, *destroy)
        };

        // A null factory is an allocation failure inside the module, the
        // one load error the host is expected to survive.
        let raw = unsafe { create() };
        if raw.is_null() {
            log::error!("{} returned a null factory", self.path);
            return Err(C2Error::NoMemory);
        }

        Ok(ComponentModule::with_factory(ModuleFactory::Foreign(
            ForeignFactory { raw, destroy },
            library,
        )))
    }
}

/// Backend wrapping a factory constructor that runs in this process.
pub struct InProcessLoader {
    build: Box<dyn Fn() -> C2Result<Box<dyn ComponentFactory>> + Send + Sync>,
}

impl InProcessLoader {
    pub fn new(
        build: impl Fn() -> C2Result<Box<dyn ComponentFactory>> + Send + Sync + 'static,
    ) -> Self {
        Self { build: Box::new(build) }
    }
}

impl LoaderBackend for InProcessLoader {
    fn load(&self) -> C2Result<ComponentModule> {
        Ok(ComponentModule::in_process((self.build)()?))
    }
}

/// Caches the loaded module weakly: a module with no remaining users is
/// released, and the next request loads it again.
pub struct ModuleLoader {
    backend: Box<dyn LoaderBackend>,
    module: Mutex<Weak<ComponentModule>>,
}

impl ModuleLoader {
    pub fn new(backend: Box<dyn LoaderBackend>) -> Self {
        Self { backend, module: Mutex::new(Weak::new()) }
    }

    pub fn fetch(&self) -> C2Result<Arc<ComponentModule>> {
        let mut cached = self.module.lock().unwrap();
        if let Some(module) = cached.upgrade() {
            return Ok(module);
        }
        let module = Arc::new(self.backend.load()?);
        *cached = Arc::downgrade(&module);
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::component::ComponentEnv;
    use crate::component::WorkListener;
    use crate::registry;
    use crate::registry::MIME_VIDEO_HEVC;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct NullFactory;

    impl ComponentFactory for NullFactory {
        fn create_component(
            &self,
            _name: &str,
            _listener: WorkListener,
            _env: ComponentEnv,
        ) -> C2Result<Component> {
            Err(C2Error::NotFound)
        }

        fn create_interface(
            &self,
            _name: &str,
        ) -> C2Result<Arc<Mutex<crate::config::ConfigInterface>>> {
            Err(C2Error::NotFound)
        }

        fn component_traits(&self, name: &str) -> C2Result<ComponentTraits> {
            registry::component_entry(name)
                .map(ComponentTraits::for_entry)
                .ok_or(C2Error::NotFound)
        }
    }

    #[test]
    fn traits_follow_the_registry_entry() {
        let entry = registry::component_entry("c2.rk.hevc.decoder.secure").unwrap();
        let traits = ComponentTraits::for_entry(entry);
        assert_eq!(traits.name, "c2.rk.hevc.decoder.secure");
        assert_eq!(traits.mime, MIME_VIDEO_HEVC);
        assert_eq!(traits.kind, Kind::Decoder);
        assert_eq!(traits.domain, Domain::Video);
        assert_eq!(traits.rank, RANK_DEFAULT);
        assert_eq!(traits.aliases, vec!["OMX.rk.video_decoder.hevc.secure"]);
    }

    #[test]
    fn alias_lists_split_on_commas_and_may_be_empty() {
        let entry = registry::component_entry("c2.rk.av1.decoder").unwrap();
        assert!(ComponentTraits::for_entry(entry).aliases.is_empty());

        let multi = registry::ComponentEntry {
            name: "c2.rk.avc.decoder",
            mime: MIME_VIDEO_HEVC,
            kind: Kind::Decoder,
            aliases: "OMX.rk.video_decoder.avc,OMX.rk.h264.decoder",
        };
        assert_eq!(
            ComponentTraits::for_entry(&multi).aliases,
            vec!["OMX.rk.video_decoder.avc", "OMX.rk.h264.decoder"]
        );
    }

    #[test]
    fn module_traits_are_queried_once_per_name() {
        let module = ComponentModule::in_process(Box::new(NullFactory));
        let first = module.traits("c2.rk.avc.decoder").unwrap();
        let second = module.traits("c2.rk.avc.decoder").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(module.traits("c2.rk.bogus").err(), Some(C2Error::NotFound));
    }

    #[test]
    #[should_panic(expected = "failed to load")]
    fn a_missing_module_aborts_the_load() {
        let _ = DylibLoader::new("libc2_rk_no_such_module_for_test.so").load();
    }

    #[test]
    fn module_is_loaded_once_and_released_when_unused() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_clone = loads.clone();
        let loader = ModuleLoader::new(Box::new(InProcessLoader::new(move || {
            loads_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullFactory) as Box<dyn ComponentFactory>)
        })));

        let first = loader.fetch().unwrap();
        let second = loader.fetch().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        drop(first);
        drop(second);
        let _third = loader.fetch().unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn load_failures_propagate() {
        let loader =
            ModuleLoader::new(Box::new(InProcessLoader::new(|| Err(C2Error::NoMemory))));
        assert_eq!(loader.fetch().err(), Some(C2Error::NoMemory));
    }
}
