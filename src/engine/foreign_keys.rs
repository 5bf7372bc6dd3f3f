use super::context::PersistenceContext;
use crate::core::{EntityRef, Value};
use crate::metadata::{EntityPersister, Type};
use std::fmt;
use std::sync::Arc;

/// Transient entities an insert references through non-nullable associations,
/// with the property paths that reference each of them
#[derive(Debug, Clone, Default)]
pub struct NonNullableTransientDependencies {
    dependencies: Vec<(EntityRef, Vec<String>)>,
}

impl NonNullableTransientDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, property_path: impl Into<String>, transient: EntityRef) {
        let path = property_path.into();
        match self
            .dependencies
            .iter_mut()
            .find(|(entity, _)| Arc::ptr_eq(entity, &transient))
        {
            Some((_, paths)) => paths.push(path),
            None => self.dependencies.push((transient, vec![path])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn non_nullable_transient_entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.dependencies.iter().map(|(entity, _)| entity)
    }

    pub fn property_paths(&self, transient: &EntityRef) -> &[String] {
        self.dependencies
            .iter()
            .find(|(entity, _)| Arc::ptr_eq(entity, transient))
            .map(|(_, paths)| paths.as_slice())
            .unwrap_or(&[])
    }

    /// Forgets `transient`; returns whether it was a dependency.
    pub fn resolve_non_nullable_transient_entity(&mut self, transient: &EntityRef) -> bool {
        let before = self.dependencies.len();
        self.dependencies
            .retain(|(entity, _)| !Arc::ptr_eq(entity, transient));
        before != self.dependencies.len()
    }
}

impl fmt::Display for NonNullableTransientDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .dependencies
            .iter()
            .map(|(entity, paths)| format!("{} via [{}]", entity, paths.join(", ")))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Finds the transient entities `instance` references through non-nullable
/// many-to-one associations, descending into embedded components.
///
/// Self references and one-to-one associations never block an insert.
pub fn find_non_nullable_transient_entities(
    persister: &EntityPersister,
    instance: &EntityRef,
    state: &[Value],
    context: &PersistenceContext,
) -> NonNullableTransientDependencies {
    let mut dependencies = NonNullableTransientDependencies::new();
    for (property, value) in persister.properties().iter().zip(state) {
        collect(
            property.name(),
            property.ty(),
            property.is_nullable(),
            value,
            instance,
            context,
            &mut dependencies,
        );
    }
    dependencies
}

fn collect(
    path: &str,
    ty: &Type,
    nullable: bool,
    value: &Value,
    instance: &EntityRef,
    context: &PersistenceContext,
    dependencies: &mut NonNullableTransientDependencies,
) {
    match (ty, value) {
        (Type::Entity(entity_type), Value::Entity(target)) => {
            if nullable || entity_type.is_one_to_one() || Arc::ptr_eq(target, instance) {
                return;
            }
            if context.is_transient(value) {
                dependencies.add(path, target.clone());
            }
        }
        (Type::Entity(entity_type), Value::Proxy(proxy)) => {
            if nullable || entity_type.is_one_to_one() {
                return;
            }
            if let Some(target) = proxy.implementation() {
                if context.is_transient(value) && !Arc::ptr_eq(&target, instance) {
                    dependencies.add(path, target);
                }
            }
        }
        (Type::Component(component), Value::Component(values)) => {
            let subproperties = component
                .property_names()
                .iter()
                .zip(component.subtypes())
                .zip(component.property_nullability())
                .zip(values);
            for (((name, subtype), sub_nullable), sub_value) in subproperties {
                collect(
                    &format!("{}.{}", path, name),
                    subtype,
                    *sub_nullable,
                    sub_value,
                    instance,
                    context,
                    dependencies,
                );
            }
        }
        _ => {}
    }
}
