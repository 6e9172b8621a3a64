// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! The vendor component store: the process-wide entry point the host uses
//! to enumerate codecs and instantiate them.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use crate::component::Component;
use crate::component::ComponentEnv;
use crate::component::WorkListener;
use crate::config::ConfigInterface;
use crate::config::HeapSupport;
use crate::error::C2Error;
use crate::error::C2Result;
use crate::loader::ComponentTraits;
use crate::loader::DylibLoader;
use crate::loader::ModuleLoader;
use crate::registry;
use crate::registry::ChipCapability;
use crate::registry::FullSupport;
use crate::registry::Kind;

const STORE_NAME: &str = "c2.rk.vendor.store";

/// Listings are immutable per SoC, so a short cache absorbs the host's
/// habit of re-enumerating on every codec creation.
const LISTING_TTL: Duration = Duration::from_millis(500);

struct ListingCache {
    traits: Vec<Arc<ComponentTraits>>,
    refreshed: Option<Instant>,
}

pub struct ComponentStore {
    loader: ModuleLoader,
    caps: Arc<dyn ChipCapability>,
    interface: Arc<Mutex<ConfigInterface>>,
    listing: Mutex<ListingCache>,
}

impl ComponentStore {
    pub fn with_parts(loader: ModuleLoader, caps: Arc<dyn ChipCapability>) -> Arc<Self> {
        Arc::new(Self {
            loader,
            caps,
            interface: Arc::new(Mutex::new(ConfigInterface::for_store(HeapSupport::detect()))),
            listing: Mutex::new(ListingCache { traits: Vec::new(), refreshed: None }),
        })
    }

    pub fn name(&self) -> &'static str {
        STORE_NAME
    }

    pub fn interface(&self) -> Arc<Mutex<ConfigInterface>> {
        self.interface.clone()
    }

    /// Traits of every registry entry the running SoC can actually service,
    /// as described by the implementation module. The first listing loads
    /// the module; the traits themselves are cached on it.
    pub fn list_components(&self) -> Vec<Arc<ComponentTraits>> {
        let mut listing = self.listing.lock().unwrap();
        let stale = match listing.refreshed {
            Some(at) => at.elapsed() > LISTING_TTL,
            None => true,
        };
        if stale {
            let module = match self.loader.fetch() {
                Ok(module) => module,
                Err(err) => {
                    log::error!("cannot load the implementation module: {err}");
                    return Vec::new();
                }
            };
            listing.traits = registry::COMPONENT_TABLE
                .iter()
                .filter(|entry| {
                    registry::coding_from_mime(entry.mime)
                        .is_some_and(|coding| self.caps.supported(entry.kind, coding))
                })
                .filter_map(|entry| match module.traits(entry.name) {
                    Ok(traits) => Some(traits),
                    Err(err) => {
                        log::warn!("{}: module reports no traits: {err}", entry.name);
                        None
                    }
                })
                .collect();
            listing.refreshed = Some(Instant::now());
        }
        listing.traits.clone()
    }

    fn lookup(&self, name: &str) -> C2Result<&'static registry::ComponentEntry> {
        let entry = registry::component_entry(name).ok_or(C2Error::NotFound)?;
        let coding = registry::coding_from_mime(entry.mime).ok_or(C2Error::NotFound)?;
        // Components the SoC cannot service are indistinguishable from
        // unknown names.
        if !self.caps.supported(entry.kind, coding) {
            return Err(C2Error::NotFound);
        }
        Ok(entry)
    }

    /// Instantiates a codec. The returned component pins the implementation
    /// module in memory until it is dropped.
    pub fn create_component(
        &self,
        name: &str,
        listener: WorkListener,
        env: ComponentEnv,
    ) -> C2Result<Component> {
        self.lookup(name)?;
        let module = self.loader.fetch()?;
        let mut component = module.factory().create_component(name, listener, env)?;
        component.attach_module(module);
        Ok(component)
    }

    /// Interfaces are built from the registry alone; no codec instance and
    /// no module load happen here.
    pub fn create_interface(&self, name: &str) -> C2Result<Arc<Mutex<ConfigInterface>>> {
        let entry = self.lookup(name)?;
        let interface = match entry.kind {
            Kind::Decoder => ConfigInterface::for_decoder(entry.name),
            Kind::Encoder => ConfigInterface::for_encoder(entry.name),
        };
        Ok(Arc::new(Mutex::new(interface)))
    }

    /// Cross-buffer copies are not serviced by this store.
    pub fn copy_buffer(&self) -> C2Result<()> {
        Err(C2Error::Omitted)
    }
}

static STORE: OnceLock<Mutex<Weak<ComponentStore>>> = OnceLock::new();

/// Process-wide store accessor. The store lives only while someone holds
/// it; a later call after the last drop builds a fresh one.
pub fn get_store() -> Arc<ComponentStore> {
    let slot = STORE.get_or_init(|| Mutex::new(Weak::new()));
    let mut cached = slot.lock().unwrap();
    if let Some(store) = cached.upgrade() {
        return store;
    }
    let store = ComponentStore::with_parts(
        ModuleLoader::new(Box::new(DylibLoader::default())),
        Arc::new(FullSupport),
    );
    *cached = Arc::downgrade(&store);
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::BlockPool;
    use crate::component::ComponentFactory;
    use crate::component::GraphicBlock;
    use crate::component::RkComponentFactory;
    use crate::gralloc::GrallocOps;
    use crate::mpi::fake::FakeBackend;
    use crate::CodingType;
    use crate::PixelFormat;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;

    struct EmptyPool;

    impl BlockPool for EmptyPool {
        fn fetch_graphic_block(
            &mut self,
            _width: u32,
            _height: u32,
            _format: PixelFormat,
            _usage: u64,
        ) -> C2Result<GraphicBlock> {
            Err(C2Error::TimedOut)
        }
    }

    struct CountingCaps {
        calls: AtomicUsize,
        deny: Option<CodingType>,
    }

    impl ChipCapability for CountingCaps {
        fn supported(&self, _kind: Kind, coding: CodingType) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(coding) != self.deny
        }
    }

    fn fake_store(deny: Option<CodingType>) -> (Arc<ComponentStore>, Arc<CountingCaps>) {
        let caps = Arc::new(CountingCaps { calls: AtomicUsize::new(0), deny });
        let loader = ModuleLoader::new(Box::new(crate::loader::InProcessLoader::new(|| {
            Ok(Box::new(RkComponentFactory::new(
                FakeBackend::with_script(Vec::new()),
                Arc::new(GrallocOps::new(4)),
                Arc::new(FullSupport),
            )) as Box<dyn ComponentFactory>)
        })));
        (ComponentStore::with_parts(loader, caps.clone()), caps)
    }

    fn null_listener() -> WorkListener {
        WorkListener::new(|_work| {}, |_err| {}, |_fmt| {})
    }

    #[test]
    fn listing_excludes_unsupported_codings() {
        let (store, _caps) = fake_store(Some(CodingType::Avs2));
        let listed = store.list_components();
        assert!(listed.iter().all(|t| !t.name.contains("avs2")));
        assert!(listed.iter().any(|t| t.name == "c2.rk.avc.decoder"));
        assert_eq!(
            listed.len(),
            registry::COMPONENT_TABLE.len() - 2 // avs2 decoder and its secure twin
        );
    }

    #[test]
    fn listing_loads_the_module_and_plumbs_aliases() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_clone = loads.clone();
        let loader = ModuleLoader::new(Box::new(crate::loader::InProcessLoader::new(move || {
            loads_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RkComponentFactory::new(
                FakeBackend::with_script(Vec::new()),
                Arc::new(GrallocOps::new(4)),
                Arc::new(FullSupport),
            )) as Box<dyn ComponentFactory>)
        })));
        let store = ComponentStore::with_parts(loader, Arc::new(FullSupport));

        let listed = store.list_components();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        let avc = listed.iter().find(|t| t.name == "c2.rk.avc.decoder").unwrap();
        assert_eq!(avc.aliases, vec!["OMX.rk.video_decoder.avc"]);
        let av1 = listed.iter().find(|t| t.name == "c2.rk.av1.decoder").unwrap();
        assert!(av1.aliases.is_empty());
    }

    #[test]
    fn listing_is_cached_between_calls() {
        let (store, caps) = fake_store(None);
        store.list_components();
        let after_first = caps.calls.load(Ordering::SeqCst);
        store.list_components();
        assert_eq!(caps.calls.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn unsupported_components_read_as_not_found() {
        let (store, _caps) = fake_store(Some(CodingType::Hevc));
        assert_eq!(store.create_interface("c2.rk.hevc.decoder").err(), Some(C2Error::NotFound));
        assert_eq!(store.create_interface("c2.rk.bogus.decoder").err(), Some(C2Error::NotFound));
        assert!(store.create_interface("c2.rk.avc.decoder").is_ok());
    }

    #[test]
    fn components_are_created_with_registry_traits() {
        let (store, _caps) = fake_store(None);
        let env = ComponentEnv {
            pool: Some(Arc::new(Mutex::new(EmptyPool))),
            tunneled: false,
        };
        let component =
            store.create_component("c2.rk.avc.decoder", null_listener(), env).unwrap();
        assert_eq!(component.name(), "c2.rk.avc.decoder");
        assert_eq!(component.traits().kind, Kind::Decoder);
    }

    #[test]
    fn copy_buffer_is_not_serviced() {
        let (store, _caps) = fake_store(None);
        assert_eq!(store.copy_buffer(), Err(C2Error::Omitted));
    }

    #[test]
    fn concurrent_accessors_share_one_store() {
        let handles: Vec<_> = (0..8).map(|_| thread::spawn(get_store)).collect();
        let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for store in &stores[1..] {
            assert!(Arc::ptr_eq(&stores[0], store));
        }
        assert_eq!(stores[0].name(), "c2.rk.vendor.store");
    }
}
