use std::collections::HashMap;

use async_trait::async_trait;
use graphql_parser::schema::{Definition, TypeDefinition, TypeExtension, parse_schema};
use tracing::debug;

use crate::{FederatedSchema, ServiceDescriptor, error::BuildError};

/// Turns a set of service descriptors into one servable gateway schema.
#[async_trait]
pub trait GatewayBuilder {
    type Schema: Clone + Send + Sync;

    async fn build_schema(&self, services: &[ServiceDescriptor])
    -> Result<Self::Schema, BuildError>;
}

/// Indexes every type, field and argument to the services that define it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TypeMapGatewayBuilder;

impl TypeMapGatewayBuilder {
    pub fn new() -> Self {
        TypeMapGatewayBuilder
    }
}

#[derive(Default)]
struct TypeIndex(HashMap<String, Vec<String>>);

impl TypeIndex {
    fn add(&mut self, key: String, service: &str) {
        let owners = self.0.entry(key).or_default();
        if !owners.iter().any(|owner| owner == service) {
            owners.push(service.to_string());
        }
    }

    fn add_object<'a>(
        &mut self,
        type_name: &str,
        fields: &[graphql_parser::schema::Field<'a, String>],
        service: &str,
    ) {
        self.add(type_name.to_string(), service);
        for field in fields {
            let field_key = format!("{}.{}", type_name, field.name);
            for arg in &field.arguments {
                self.add(format!("{}.{}", field_key, arg.name), service);
            }
            self.add(field_key, service);
        }
    }
}

fn type_name<'d, 'a>(typedef: &'d TypeDefinition<'a, String>) -> &'d str {
    match typedef {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

#[async_trait]
impl GatewayBuilder for TypeMapGatewayBuilder {
    type Schema = FederatedSchema;

    async fn build_schema(
        &self,
        services: &[ServiceDescriptor],
    ) -> Result<FederatedSchema, BuildError> {
        let mut index = TypeIndex::default();

        for service in services {
            let document =
                parse_schema::<String>(&service.sdl).map_err(|e| BuildError::InvalidSdl {
                    service: service.name.clone(),
                    message: e.to_string(),
                })?;

            for definition in &document.definitions {
                match definition {
                    Definition::TypeDefinition(TypeDefinition::Object(obj)) => {
                        index.add_object(&obj.name, &obj.fields, &service.name)
                    }
                    Definition::TypeDefinition(typedef) => {
                        index.add(type_name(typedef).to_string(), &service.name)
                    }
                    Definition::TypeExtension(TypeExtension::Object(ext)) => {
                        index.add_object(&ext.name, &ext.fields, &service.name)
                    }
                    _ => {}
                }
            }
        }

        debug!(entries = index.0.len(), services = services.len(), "built type map");
        Ok(FederatedSchema {
            services: services
                .iter()
                .map(|service| (service.name.clone(), service.clone()))
                .collect(),
            type_to_service_map: index.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn service(name: &str, sdl: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            url: format!("http://{name}/graphql"),
            sdl: sdl.to_string(),
        }
    }

    #[tokio::test]
    async fn maps_types_fields_and_arguments_to_services() {
        let services = vec![
            service(
                "products",
                "type Query { product(upc: ID!): Product } type Product { upc: ID! name: String } enum Color { RED }",
            ),
            service(
                "reviews",
                "type Query { reviews: [Review] } type Review { body: String } type Product { upc: ID! reviews: [Review] }",
            ),
        ];

        let schema = TypeMapGatewayBuilder::new()
            .build_schema(&services)
            .await
            .unwrap();

        let owners = |key: &str| schema.type_to_service_map.get(key).cloned().unwrap_or_default();
        assert_eq!(owners("Product"), vec!["products", "reviews"]);
        assert_eq!(owners("Product.reviews"), vec!["reviews"]);
        assert_eq!(owners("Query.product.upc"), vec!["products"]);
        assert_eq!(owners("Color"), vec!["products"]);
        assert_eq!(schema.services.len(), 2);
        assert_eq!(schema.services["reviews"].url, "http://reviews/graphql");
    }

    #[tokio::test]
    async fn indexes_object_extensions() {
        let services = vec![service(
            "inventory",
            "type Query { ok: Boolean } extend type Product { inStock: Boolean }",
        )];

        let schema = TypeMapGatewayBuilder.build_schema(&services).await.unwrap();

        assert_eq!(
            schema.type_to_service_map["Product.inStock"],
            vec!["inventory"]
        );
    }

    #[tokio::test]
    async fn reports_the_service_with_invalid_sdl() {
        let services = vec![service("broken", "type Query {")];

        let err = TypeMapGatewayBuilder.build_schema(&services).await.unwrap_err();

        assert!(matches!(err, BuildError::InvalidSdl { ref service, .. } if service == "broken"));
    }
}
