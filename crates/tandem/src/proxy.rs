//! Typed client contracts.
//!
//! [`proxy!`](crate::proxy!) declares a struct whose methods map one to one
//! onto an endpoint's wire method names:
//!
//! ```ignore
//! tandem::proxy! {
//!     /// Client for the math service.
//!     pub struct MathProxy for "IMath" {
//!         rpc "Sum" => fn sum(a: i32, b: i32) -> i32;
//!         rpc "Reset" => fn reset();
//!         oneway "Log" => fn log(line: String);
//!         upload "Store" => fn store(name: String) -> u64;
//!         download "Fetch" => fn fetch(name: String);
//!     }
//! }
//!
//! let math: MathProxy = factory.proxy(connector);
//! assert_eq!(math.sum(1, 2).await?, 3);
//! ```
//!
//! `upload` methods take the body as a trailing [`BodySource`](crate::BodySource)
//! argument; `download` methods return a [`Body`](crate::Body).

use crate::client::ServiceClient;

/// A typed client for one endpoint.
pub trait Proxy: Sized {
    /// The endpoint name this contract is served under by default.
    const ENDPOINT: &'static str;

    /// Target a differently named endpoint with the same contract.
    fn with_endpoint(client: ServiceClient, endpoint: &str) -> Self;

    fn new(client: ServiceClient) -> Self {
        Self::with_endpoint(client, Self::ENDPOINT)
    }
}

#[macro_export]
macro_rules! proxy {
    (@method rpc $wire:literal $method:ident ($($arg:ident : $ty:ty),*) -> $ret:ty) => {
        #[doc = concat!("Calls `", $wire, "`.")]
        pub async fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<$ret, $crate::RpcError> {
            self.client
                .call(&self.endpoint, $wire, ($($arg,)*), self.options.clone())
                .await
        }
    };
    (@method rpc $wire:literal $method:ident ($($arg:ident : $ty:ty),*)) => {
        #[doc = concat!("Calls `", $wire, "`.")]
        pub async fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<(), $crate::RpcError> {
            self.client
                .call::<_, ()>(&self.endpoint, $wire, ($($arg,)*), self.options.clone())
                .await
        }
    };
    (@method oneway $wire:literal $method:ident ($($arg:ident : $ty:ty),*)) => {
        #[doc = concat!("Sends `", $wire, "` without waiting for a result.")]
        pub async fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<(), $crate::RpcError> {
            self.client
                .call_one_way(&self.endpoint, $wire, ($($arg,)*), self.options.clone())
                .await
        }
    };
    (@method upload $wire:literal $method:ident ($($arg:ident : $ty:ty),*) -> $ret:ty) => {
        #[doc = concat!("Calls `", $wire, "`, sending `body` after the arguments.")]
        pub async fn $method(
            &self,
            $($arg: $ty,)*
            body: $crate::BodySource,
        ) -> ::std::result::Result<$ret, $crate::RpcError> {
            self.client
                .upload(&self.endpoint, $wire, ($($arg,)*), body, self.options.clone())
                .await
        }
    };
    (@method download $wire:literal $method:ident ($($arg:ident : $ty:ty),*)) => {
        #[doc = concat!("Calls `", $wire, "` and returns the body that follows its response.")]
        pub async fn $method(&self, $($arg: $ty),*) -> ::std::result::Result<$crate::Body, $crate::RpcError> {
            self.client
                .download(&self.endpoint, $wire, ($($arg,)*), self.options.clone())
                .await
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $endpoint:literal {
            $(
                $kind:ident $wire:literal => fn $method:ident ( $($arg:ident : $ty:ty),* $(,)? ) $(-> $ret:ty)? ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            client: $crate::ServiceClient,
            endpoint: ::std::sync::Arc<str>,
            options: $crate::CallOptions,
        }

        impl $crate::Proxy for $name {
            const ENDPOINT: &'static str = $endpoint;

            fn with_endpoint(client: $crate::ServiceClient, endpoint: &str) -> Self {
                Self {
                    client,
                    endpoint: ::std::sync::Arc::from(endpoint),
                    options: $crate::CallOptions::default(),
                }
            }
        }

        #[allow(dead_code)]
        impl $name {
            pub fn new(client: $crate::ServiceClient) -> Self {
                <Self as $crate::Proxy>::new(client)
            }

            /// A copy whose calls use `options`.
            pub fn with_options(&self, options: $crate::CallOptions) -> Self {
                Self {
                    options,
                    ..self.clone()
                }
            }

            pub fn client(&self) -> &$crate::ServiceClient {
                &self.client
            }

            pub fn endpoint(&self) -> &str {
                &self.endpoint
            }

            $(
                $crate::proxy!(@method $kind $wire $method ($($arg : $ty),*) $(-> $ret)?);
            )*
        }
    };
}
