// Copyright 2020 The Darkstar Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Optional rewriting of operation arguments.
//!
//! A host that wants to interpose on the mutating operations (for example,
//! to substitute wrapper objects or translate foreign ids) wraps the
//! service in a [`HookedDataService`]. The decorator exposes the same
//! operation surface and passes the object argument of `set_binding`,
//! `remove_object`, `mark_for_update` and `create_reference`, and the raw
//! id of `reference_for_id`, through the [`DataHooks`] implementation
//! before routing.

use crate::data::object::{Managed, ManagedObject};
use crate::data::reference::ManagedRef;
use crate::data::DataService;
use crate::errors::DataError;

/// Replacement functions applied to operation arguments.
///
/// Every hook defaults to the identity.
pub trait DataHooks: Send + Sync + 'static {
    /// Rewrites the object argument of the mutating operations.
    fn rewrite_object<T: ManagedObject>(&self, object: Managed<T>) -> Managed<T> {
        object
    }

    /// Rewrites the raw id handed to `reference_for_id`.
    fn rewrite_id(&self, id: u64) -> u64 {
        id
    }
}

/// A decorator around [`DataService`] that rewrites operation arguments
/// through a [`DataHooks`] implementation.
#[derive(Debug, Clone)]
pub struct HookedDataService<H> {
    service: DataService,
    hooks: H,
}

impl<H: DataHooks> HookedDataService<H> {
    /// Wraps `service` with `hooks`.
    pub fn new(service: DataService, hooks: H) -> Self {
        Self { service, hooks }
    }

    /// The wrapped service.
    pub fn inner(&self) -> &DataService {
        &self.service
    }

    /// See [`DataService::run_task`].
    pub fn run_task<R>(
        &self,
        task: impl FnMut() -> Result<R, DataError>,
    ) -> Result<R, DataError> {
        self.service.run_task(task)
    }

    /// See [`DataService::get_binding`].
    pub fn get_binding<T: ManagedObject>(&self, name: &str) -> Result<Managed<T>, DataError> {
        self.service.get_binding(name)
    }

    /// See [`DataService::set_binding`]; the object is rewritten first.
    pub fn set_binding<T: ManagedObject>(
        &self,
        name: &str,
        object: &Managed<T>,
    ) -> Result<(), DataError> {
        let object = self.hooks.rewrite_object(object.clone());
        self.service.set_binding(name, &object)
    }

    /// See [`DataService::remove_binding`].
    pub fn remove_binding(&self, name: &str) -> Result<(), DataError> {
        self.service.remove_binding(name)
    }

    /// See [`DataService::next_bound_name`].
    pub fn next_bound_name(&self, name: Option<&str>) -> Result<Option<String>, DataError> {
        self.service.next_bound_name(name)
    }

    /// See [`DataService::create_reference`]; the object is rewritten first.
    pub fn create_reference<T: ManagedObject>(
        &self,
        object: &Managed<T>,
    ) -> Result<ManagedRef<T>, DataError> {
        let object = self.hooks.rewrite_object(object.clone());
        self.service.create_reference(&object)
    }

    /// See [`DataService::mark_for_update`]; the object is rewritten first.
    pub fn mark_for_update<T: ManagedObject>(&self, object: &Managed<T>) -> Result<(), DataError> {
        let object = self.hooks.rewrite_object(object.clone());
        self.service.mark_for_update(&object)
    }

    /// See [`DataService::remove_object`]; the object is rewritten first.
    pub fn remove_object<T: ManagedObject>(&self, object: &Managed<T>) -> Result<(), DataError> {
        let object = self.hooks.rewrite_object(object.clone());
        self.service.remove_object(&object)
    }

    /// See [`DataService::reference_for_id`]; the id is rewritten first.
    pub fn reference_for_id<T: ManagedObject>(
        &self,
        raw: u64,
    ) -> Result<ManagedRef<T>, DataError> {
        self.service.reference_for_id(self.hooks.rewrite_id(raw))
    }
}
