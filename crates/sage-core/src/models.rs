//! Core data models for sage-supervisor.
//!
//! These types are shared across all sage crates: the raw records decoded from
//! queue payloads, the typed domain events handed to subscribers, and the
//! queue message envelope.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// CHANGE CLASSIFICATION
// =============================================================================

/// Kind of row operation reported by the upstream trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Any operation string the upstream emits that is not recognised
    Unknown,
}

impl OperationKind {
    /// Map a wire operation string (case-sensitive) to an operation.
    ///
    /// Unrecognised strings resolve to [`OperationKind::Unknown`]; they are
    /// never rejected.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "INSERT" => OperationKind::Insert,
            "UPDATE" => OperationKind::Update,
            "DELETE" => OperationKind::Delete,
            _ => OperationKind::Unknown,
        }
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical subject of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Commercial document header (F_DOCENTETE)
    Document,
    /// Third party: customer, supplier, employee (F_COMPTET)
    Party,
    /// Any other monitored table
    GenericTable,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Document,
        EntityKind::Party,
        EntityKind::GenericTable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Party => "party",
            EntityKind::GenericTable => "table",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CODE TABLES
// =============================================================================

/// Business domain of a commercial document (`Domaine` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentDomain {
    Vente,
    Achat,
    Stock,
    Ticket,
    DocumentInterne,
}

impl DocumentDomain {
    /// Look up a domain code. Unknown codes return `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DocumentDomain::Vente),
            1 => Some(DocumentDomain::Achat),
            2 => Some(DocumentDomain::Stock),
            3 => Some(DocumentDomain::Ticket),
            4 => Some(DocumentDomain::DocumentInterne),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentDomain::Vente => "Vente",
            DocumentDomain::Achat => "Achat",
            DocumentDomain::Stock => "Stock",
            DocumentDomain::Ticket => "Ticket",
            DocumentDomain::DocumentInterne => "Document interne",
        }
    }
}

/// Piece type of a commercial document (`Type` attribute on F_DOCENTETE).
///
/// Codes are grouped by decade: 0x sales, 1x purchases, 2x stock,
/// 30 till tickets, 4x internal documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    VenteDevis,
    VenteBonCommande,
    VentePreparationLivraison,
    VenteBonLivraison,
    VenteBonRetour,
    VenteBonAvoir,
    VenteFacture,
    VenteFactureComptabilisee,
    VenteArchive,
    AchatDemande,
    AchatPreparationCommande,
    AchatBonCommande,
    AchatBonLivraison,
    AchatBonRetour,
    AchatBonAvoir,
    AchatFacture,
    AchatFactureComptabilisee,
    AchatArchive,
    StockMouvementEntree,
    StockMouvementSortie,
    StockDepreciation,
    StockVirementDepot,
    StockPreparationFabrication,
    StockOrdreFabrication,
    StockBonFabrication,
    StockArchive,
    Ticket,
    InterneDocument1,
    InterneDocument2,
    InterneDocument3,
    InterneDocument4,
    InterneDocument5,
    InterneDocument6,
    InterneSaisieRealise,
    InterneArchive,
}

impl DocumentType {
    /// Look up a piece type code. Unknown codes return `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        use DocumentType::*;
        let t = match code {
            0 => VenteDevis,
            1 => VenteBonCommande,
            2 => VentePreparationLivraison,
            3 => VenteBonLivraison,
            4 => VenteBonRetour,
            5 => VenteBonAvoir,
            6 => VenteFacture,
            7 => VenteFactureComptabilisee,
            8 => VenteArchive,
            10 => AchatDemande,
            11 => AchatPreparationCommande,
            12 => AchatBonCommande,
            13 => AchatBonLivraison,
            14 => AchatBonRetour,
            15 => AchatBonAvoir,
            16 => AchatFacture,
            17 => AchatFactureComptabilisee,
            18 => AchatArchive,
            20 => StockMouvementEntree,
            21 => StockMouvementSortie,
            22 => StockDepreciation,
            23 => StockVirementDepot,
            24 => StockPreparationFabrication,
            25 => StockOrdreFabrication,
            26 => StockBonFabrication,
            27 => StockArchive,
            30 => Ticket,
            40 => InterneDocument1,
            41 => InterneDocument2,
            42 => InterneDocument3,
            43 => InterneDocument4,
            44 => InterneDocument5,
            45 => InterneDocument6,
            46 => InterneSaisieRealise,
            47 => InterneArchive,
            _ => return None,
        };
        Some(t)
    }

    /// Domain implied by the piece type's decade.
    pub fn domain(&self) -> DocumentDomain {
        use DocumentType::*;
        match self {
            VenteDevis | VenteBonCommande | VentePreparationLivraison | VenteBonLivraison
            | VenteBonRetour | VenteBonAvoir | VenteFacture | VenteFactureComptabilisee
            | VenteArchive => DocumentDomain::Vente,
            AchatDemande | AchatPreparationCommande | AchatBonCommande | AchatBonLivraison
            | AchatBonRetour | AchatBonAvoir | AchatFacture | AchatFactureComptabilisee
            | AchatArchive => DocumentDomain::Achat,
            StockMouvementEntree | StockMouvementSortie | StockDepreciation
            | StockVirementDepot | StockPreparationFabrication | StockOrdreFabrication
            | StockBonFabrication | StockArchive => DocumentDomain::Stock,
            Ticket => DocumentDomain::Ticket,
            InterneDocument1 | InterneDocument2 | InterneDocument3 | InterneDocument4
            | InterneDocument5 | InterneDocument6 | InterneSaisieRealise | InterneArchive => {
                DocumentDomain::DocumentInterne
            }
        }
    }

    /// Piece label without its domain.
    pub fn label(&self) -> &'static str {
        use DocumentType::*;
        match self {
            VenteDevis => "Devis",
            VenteBonCommande | AchatBonCommande => "Bon de commande",
            VentePreparationLivraison => "Préparation de livraison",
            VenteBonLivraison | AchatBonLivraison => "Bon de livraison",
            VenteBonRetour | AchatBonRetour => "Bon de retour",
            VenteBonAvoir | AchatBonAvoir => "Bon d'avoir",
            VenteFacture | AchatFacture => "Facture",
            VenteFactureComptabilisee | AchatFactureComptabilisee => "Facture comptabilisée",
            VenteArchive | AchatArchive | StockArchive | InterneArchive => "Archive",
            AchatDemande => "Demande d'achat",
            AchatPreparationCommande => "Préparation de commande",
            StockMouvementEntree => "Mouvement d'entrée",
            StockMouvementSortie => "Mouvement de sortie",
            StockDepreciation => "Dépréciation de stock",
            StockVirementDepot => "Virement de dépôt à dépôt",
            StockPreparationFabrication => "Préparation de fabrication",
            StockOrdreFabrication => "Ordre de fabrication",
            StockBonFabrication => "Bon de fabrication",
            Ticket => "Ticket",
            InterneDocument1 => "Document interne 1",
            InterneDocument2 => "Document interne 2",
            InterneDocument3 => "Document interne 3",
            InterneDocument4 => "Document interne 4",
            InterneDocument5 => "Document interne 5",
            InterneDocument6 => "Document interne 6",
            InterneSaisieRealise => "Saisie de réalisé",
        }
    }
}

/// Category of a third party (`Type` attribute on F_COMPTET).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyType {
    Client,
    Fournisseur,
    Salarie,
    Autre,
}

impl PartyType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PartyType::Client),
            1 => Some(PartyType::Fournisseur),
            2 => Some(PartyType::Salarie),
            3 => Some(PartyType::Autre),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PartyType::Client => "Client",
            PartyType::Fournisseur => "Fournisseur",
            PartyType::Salarie => "Salarié",
            PartyType::Autre => "Autre",
        }
    }
}

// =============================================================================
// RAW RECORDS
// =============================================================================

/// Kind-specific fields of a raw change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDetail {
    Document {
        domain: i32,
        subtype: i32,
        total_amount: BigDecimal,
    },
    Party {
        party_type: i32,
    },
    Table {
        domain: i32,
        subtype: i32,
    },
}

/// One change entry decoded from a queue payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChangeRecord {
    pub operation: OperationKind,
    /// Business key of the changed row; never empty.
    pub entity_id: String,
    /// Source-supplied modification time.
    pub occurred_at: NaiveDateTime,
    pub detail: RecordDetail,
}

impl RawChangeRecord {
    pub fn entity_kind(&self) -> EntityKind {
        match self.detail {
            RecordDetail::Document { .. } => EntityKind::Document,
            RecordDetail::Party { .. } => EntityKind::Party,
            RecordDetail::Table { .. } => EntityKind::GenericTable,
        }
    }

    /// Convert into the typed event for this record's kind.
    pub fn into_event(self) -> DomainEvent {
        let RawChangeRecord {
            operation,
            entity_id,
            occurred_at,
            detail,
        } = self;
        match detail {
            RecordDetail::Document {
                domain,
                subtype,
                total_amount,
            } => DomainEvent::DocumentChanged(DocumentChange {
                entity_id,
                operation,
                occurred_at,
                domain,
                subtype,
                total_amount,
            }),
            RecordDetail::Party { party_type } => DomainEvent::PartyChanged(PartyChange {
                entity_id,
                operation,
                occurred_at,
                party_type,
            }),
            RecordDetail::Table { domain, subtype } => DomainEvent::TableChanged(TableChange {
                entity_id,
                operation,
                occurred_at,
                domain,
                subtype,
            }),
        }
    }
}

// =============================================================================
// DOMAIN EVENTS
// =============================================================================

/// A commercial document header changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// Piece number (`DO_Piece`).
    pub entity_id: String,
    pub operation: OperationKind,
    pub occurred_at: NaiveDateTime,
    pub domain: i32,
    pub subtype: i32,
    /// Total excluding tax.
    pub total_amount: BigDecimal,
}

impl DocumentChange {
    pub fn document_domain(&self) -> Option<DocumentDomain> {
        DocumentDomain::from_code(self.domain)
    }

    pub fn document_type(&self) -> Option<DocumentType> {
        DocumentType::from_code(self.subtype)
    }

    /// `"<domain> / <piece>"`, or the domain alone for an unknown piece type.
    pub fn label(&self) -> Option<String> {
        match self.document_type() {
            Some(t) => Some(format!("{} / {}", t.domain().label(), t.label())),
            None => self.document_domain().map(|d| d.label().to_string()),
        }
    }
}

/// A third party changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyChange {
    /// Account number (`CT_Num`).
    pub entity_id: String,
    pub operation: OperationKind,
    pub occurred_at: NaiveDateTime,
    pub party_type: i32,
}

impl PartyChange {
    pub fn party_kind(&self) -> Option<PartyType> {
        PartyType::from_code(self.party_type)
    }
}

/// A row of a generic monitored table changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub entity_id: String,
    pub operation: OperationKind,
    pub occurred_at: NaiveDateTime,
    pub domain: i32,
    pub subtype: i32,
}

/// Typed outcome of a dispatched change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "change")]
pub enum DomainEvent {
    DocumentChanged(DocumentChange),
    PartyChanged(PartyChange),
    TableChanged(TableChange),
}

impl DomainEvent {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            DomainEvent::DocumentChanged(_) => EntityKind::Document,
            DomainEvent::PartyChanged(_) => EntityKind::Party,
            DomainEvent::TableChanged(_) => EntityKind::GenericTable,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            DomainEvent::DocumentChanged(c) => &c.entity_id,
            DomainEvent::PartyChanged(c) => &c.entity_id,
            DomainEvent::TableChanged(c) => &c.entity_id,
        }
    }

    pub fn operation(&self) -> OperationKind {
        match self {
            DomainEvent::DocumentChanged(c) => c.operation,
            DomainEvent::PartyChanged(c) => c.operation,
            DomainEvent::TableChanged(c) => c.operation,
        }
    }

    pub fn occurred_at(&self) -> NaiveDateTime {
        match self {
            DomainEvent::DocumentChanged(c) => c.occurred_at,
            DomainEvent::PartyChanged(c) => c.occurred_at,
            DomainEvent::TableChanged(c) => c.occurred_at,
        }
    }

    /// Dot-namespaced event type (e.g., `"document.changed"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::DocumentChanged(_) => "document.changed",
            DomainEvent::PartyChanged(_) => "party.changed",
            DomainEvent::TableChanged(_) => "table.changed",
        }
    }

    /// Human-readable code-table label. `None` for unknown codes and for
    /// generic table rows.
    pub fn label(&self) -> Option<String> {
        match self {
            DomainEvent::DocumentChanged(c) => c.label(),
            DomainEvent::PartyChanged(c) => c.party_kind().map(|p| p.label().to_string()),
            DomainEvent::TableChanged(_) => None,
        }
    }
}

// =============================================================================
// QUEUE MESSAGES
// =============================================================================

/// One item taken off the change queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_type: String,
    pub conversation_group_id: Option<Uuid>,
    /// Payload text; absent for dialog control messages.
    pub body: Option<String>,
}
