#![no_std]
#![deny(unsafe_code)]

pub use openlcb_svc_config as config;
pub use openlcb_svc_events as events;
pub use openlcb_svc_mns as mns;
pub use openlcb_svc_stream as stream;
pub use openlcb_svc_traction as traction;

/// Any protocol service, for storage in a homogeneous collection.
pub enum Service {
    Mns(mns::Service),
    Events(events::Service),
    Config(config::Service),
    Stream(stream::Service),
    Traction(traction::Service),
}

/// A conversion trait for protocol services.
pub trait AnyService {
    fn upcast(self) -> Service;
    fn downcast<'c>(service: &'c Service) -> Option<&'c Self>
    where
        Self: Sized;
    fn downcast_mut<'c>(service: &'c mut Service) -> Option<&'c mut Self>
    where
        Self: Sized;
}

macro_rules! from_service {
    ($service:ty, $variant:ident) => {
        impl AnyService for $service {
            fn upcast(self) -> Service {
                Service::$variant(self)
            }

            fn downcast<'c>(service: &'c Service) -> Option<&'c Self> {
                #[allow(unreachable_patterns)]
                match service {
                    Service::$variant(service) => Some(service),
                    _ => None,
                }
            }

            fn downcast_mut<'c>(service: &'c mut Service) -> Option<&'c mut Self> {
                #[allow(unreachable_patterns)]
                match service {
                    Service::$variant(service) => Some(service),
                    _ => None,
                }
            }
        }
    };
}

from_service!(mns::Service, Mns);
from_service!(events::Service, Events);
from_service!(config::Service, Config);
from_service!(stream::Service, Stream);
from_service!(traction::Service, Traction);
